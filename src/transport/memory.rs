use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct MemoryTransport {
    queues: Mutex<BTreeMap<String, VecDeque<String>>>,
    arrival: Condvar,
}

impl MemoryTransport {
    pub fn publish(&self, queue: &str, body: &str) -> Result<(), super::TransportError> {
        let mut queues = self.lock_queues();
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.to_string());
        self.arrival.notify_all();
        Ok(())
    }

    pub fn receive(&self, queue: &str, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        let mut queues = self.lock_queues();
        loop {
            if let Some(buffer) = queues.get_mut(queue) {
                if let Some(body) = buffer.pop_front() {
                    return Some(body);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = match self.arrival.wait_timeout(queues, deadline - now) {
                Ok(woken) => woken,
                Err(poisoned) => poisoned.into_inner(),
            };
            queues = guard;
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, BTreeMap<String, VecDeque<String>>> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
