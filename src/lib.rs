pub mod app;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod participant;
pub mod shared;
pub mod transport;
pub mod worker;
pub mod workitem;
