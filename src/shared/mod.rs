pub mod ids;
pub mod stop_signal;

pub use ids::new_instance_id;
pub use stop_signal::{clear_stop_signal, signal_stop, stop_requested, stop_signal_path};
