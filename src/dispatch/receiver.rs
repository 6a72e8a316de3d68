use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::Coordinator;
use crate::participant::queue_proxy;
use crate::transport::QueueTransport;

const POLL_WAIT: Duration = Duration::from_millis(200);

pub fn run_receiver(
    coordinator: Arc<Coordinator>,
    transport: Arc<QueueTransport>,
    reply_queue: String,
) {
    while !coordinator.stop_requested() {
        match transport.receive(&reply_queue, POLL_WAIT) {
            Ok(Some(body)) => queue_proxy::handle_completion(coordinator.inflight(), &body),
            Ok(None) => {}
            Err(err) => {
                warn!(queue = %reply_queue, error = %err, "failed to poll completion queue");
                thread::sleep(POLL_WAIT);
            }
        }
    }
    debug!(queue = %reply_queue, "completion receiver stopped");
}
