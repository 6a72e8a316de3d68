use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use super::run_worker;
use crate::participant::Participant;
use crate::transport::QueueTransport;

const MONITOR_WAIT: Duration = Duration::from_millis(200);

pub fn run_worker_pool(
    transport: &Arc<QueueTransport>,
    queue: &str,
    participant: &Arc<Participant>,
    reply_queue: &str,
    instances: usize,
    stop: &Arc<AtomicBool>,
) {
    let pool_transport = Arc::clone(transport);
    let pool_participant = Arc::clone(participant);
    let pool_stop = Arc::clone(stop);
    let pool_queue = queue.to_string();
    let pool_reply = reply_queue.to_string();
    supervise_instances(queue, instances, stop, move |_slot| {
        let transport = Arc::clone(&pool_transport);
        let participant = Arc::clone(&pool_participant);
        let stop = Arc::clone(&pool_stop);
        let queue = pool_queue.clone();
        let reply_queue = pool_reply.clone();
        thread::spawn(move || run_worker(&transport, &queue, &participant, &reply_queue, &stop))
    });
}

pub fn supervise_instances<F>(
    pool: &str,
    instances: usize,
    stop: &Arc<AtomicBool>,
    spawn_instance: F,
) where
    F: Fn(usize) -> JoinHandle<()>,
{
    let mut slots: Vec<JoinHandle<()>> = (0..instances).map(&spawn_instance).collect();
    info!(pool = %pool, instances, "worker pool started");
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(MONITOR_WAIT);
        for (slot, handle) in slots.iter_mut().enumerate() {
            if stop.load(Ordering::SeqCst) || !handle.is_finished() {
                continue;
            }
            error!(pool = %pool, slot, "worker instance crashed unexpectedly, restarting");
            let crashed = std::mem::replace(handle, spawn_instance(slot));
            let _ = crashed.join();
        }
    }
    for handle in slots {
        let _ = handle.join();
    }
    info!(pool = %pool, "worker pool stopped");
}
