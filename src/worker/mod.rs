pub mod pool;

pub use pool::{run_worker_pool, supervise_instances};

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::participant::{Consumption, Participant};
use crate::transport::QueueTransport;
use crate::workitem::{decode, encode};

const POLL_WAIT: Duration = Duration::from_millis(200);

pub fn run_worker(
    transport: &QueueTransport,
    queue: &str,
    participant: &Participant,
    reply_queue: &str,
    stop: &AtomicBool,
) {
    info!(
        queue = %queue,
        reply_queue = %reply_queue,
        kind = participant.kind(),
        "worker loop started"
    );
    while !stop.load(Ordering::SeqCst) {
        let body = match transport.receive(queue, POLL_WAIT) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) => {
                warn!(queue = %queue, error = %err, "failed to poll work queue");
                thread::sleep(POLL_WAIT);
                continue;
            }
        };
        let workitem = match decode(&body) {
            Ok(workitem) => workitem,
            Err(err) => {
                warn!(queue = %queue, error = %err, "discarding malformed workitem");
                continue;
            }
        };
        let reply = match participant.consume(&workitem) {
            Ok(Consumption::Completed(reply)) => reply,
            Ok(Consumption::Pending) => {
                warn!(
                    queue = %queue,
                    instance = %workitem.instance_id,
                    "queue proxy participant cannot answer from a worker loop, discarding"
                );
                continue;
            }
            Err(err) => {
                let mut annotated = workitem.clone();
                annotated.set_error(&err.to_string());
                annotated.set_trace(&format!("{err:?}"));
                annotated
            }
        };
        let payload = match encode(&reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    queue = %queue,
                    instance = %reply.instance_id,
                    error = %err,
                    "failed to encode worker reply"
                );
                continue;
            }
        };
        if let Err(err) = transport.publish(reply_queue, &payload) {
            warn!(
                queue = %reply_queue,
                instance = %reply.instance_id,
                error = %err,
                "failed to publish worker reply"
            );
        }
    }
    info!(queue = %queue, "worker loop stopped");
}

pub fn run_dispatcher(transport: &QueueTransport, intake_queue: &str, stop: &AtomicBool) {
    info!(queue = %intake_queue, "dispatcher loop started");
    while !stop.load(Ordering::SeqCst) {
        let body = match transport.receive(intake_queue, POLL_WAIT) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) => {
                warn!(queue = %intake_queue, error = %err, "failed to poll intake queue");
                thread::sleep(POLL_WAIT);
                continue;
            }
        };
        let workitem = match decode(&body) {
            Ok(workitem) => workitem,
            Err(err) => {
                warn!(queue = %intake_queue, error = %err, "discarding malformed workitem");
                continue;
            }
        };
        let Some(worker_type) = workitem.param_str("worker_type") else {
            warn!(
                queue = %intake_queue,
                instance = %workitem.instance_id,
                "discarding workitem without worker_type param"
            );
            continue;
        };
        let target = format!("worker_{worker_type}");
        if let Err(err) = transport.publish(&target, &body) {
            warn!(
                queue = %target,
                instance = %workitem.instance_id,
                error = %err,
                "failed to route workitem"
            );
        } else {
            info!(queue = %target, instance = %workitem.instance_id, "routed workitem");
        }
    }
    info!(queue = %intake_queue, "dispatcher loop stopped");
}
