use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

use crate::participant::ParticipantError;
use crate::transport::QueueTransport;
use crate::workitem::{decode, encode, Workitem};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub instance_id: String,
    pub step_id: String,
}

impl CorrelationKey {
    pub fn of(workitem: &Workitem) -> Self {
        Self {
            instance_id: workitem.instance_id.clone(),
            step_id: workitem.step_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InflightDispatch {
    pub dispatched_at: i64,
    pub snapshot: Workitem,
}

#[derive(Debug, Clone)]
enum InflightState {
    Outstanding(InflightDispatch),
    Completed(Workitem),
}

#[derive(Debug, Default)]
pub struct InflightTable {
    entries: Mutex<BTreeMap<CorrelationKey, InflightState>>,
    changed: Condvar,
}

impl InflightTable {
    pub fn register(&self, key: CorrelationKey, snapshot: Workitem) {
        let dispatch = InflightDispatch {
            dispatched_at: now_secs(),
            snapshot,
        };
        self.lock_entries()
            .insert(key, InflightState::Outstanding(dispatch));
    }

    pub fn discard(&self, key: &CorrelationKey) {
        self.lock_entries().remove(key);
    }

    pub fn complete(&self, key: CorrelationKey, result: Workitem) -> bool {
        let mut entries = self.lock_entries();
        match entries.get(&key) {
            Some(InflightState::Outstanding(_)) => {
                entries.insert(key, InflightState::Completed(result));
                self.changed.notify_all();
                true
            }
            _ => false,
        }
    }

    pub fn wait_completed(&self, key: &CorrelationKey) -> Option<Workitem> {
        let mut entries = self.lock_entries();
        loop {
            match entries.get(key) {
                Some(InflightState::Completed(_)) => {
                    let Some(InflightState::Completed(result)) = entries.remove(key) else {
                        return None;
                    };
                    return Some(result);
                }
                Some(InflightState::Outstanding(_)) => {}
                None => return None,
            }
            entries = match self.changed.wait_timeout(entries, Duration::from_millis(200)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn abandon_outstanding(&self) -> Vec<(CorrelationKey, InflightDispatch)> {
        let mut entries = self.lock_entries();
        let keys: Vec<CorrelationKey> = entries
            .iter()
            .filter(|(_, state)| matches!(state, InflightState::Outstanding(_)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut abandoned = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(InflightState::Outstanding(dispatch)) = entries.remove(&key) {
                abandoned.push((key, dispatch));
            }
        }
        self.changed.notify_all();
        abandoned
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<CorrelationKey, InflightState>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug)]
pub struct QueueProxy {
    queue: String,
    transport: Arc<QueueTransport>,
    inflight: Arc<InflightTable>,
}

impl QueueProxy {
    pub fn new(queue: String, transport: Arc<QueueTransport>, inflight: Arc<InflightTable>) -> Self {
        Self {
            queue,
            transport,
            inflight,
        }
    }

    pub fn dispatch(&self, workitem: &Workitem) -> Result<(), ParticipantError> {
        let key = CorrelationKey::of(workitem);
        let payload = encode(workitem).map_err(|source| ParticipantError::Encode {
            participant: workitem.participant_name.clone(),
            source,
        })?;
        self.inflight.register(key.clone(), workitem.clone());
        if let Err(source) = self.transport.publish(&self.queue, &payload) {
            self.inflight.discard(&key);
            return Err(ParticipantError::Publish {
                queue: self.queue.clone(),
                source,
            });
        }
        info!(
            queue = %self.queue,
            instance = %key.instance_id,
            step = %key.step_id,
            "dispatched workitem to queue"
        );
        Ok(())
    }
}

pub fn handle_completion(inflight: &InflightTable, body: &str) {
    let reply = match decode(body) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(error = %err, "discarding malformed completion payload");
            return;
        }
    };
    let key = CorrelationKey::of(&reply);
    if inflight.complete(key.clone(), reply) {
        info!(
            instance = %key.instance_id,
            step = %key.step_id,
            "completion matched an outstanding dispatch"
        );
    } else {
        warn!(
            instance = %key.instance_id,
            step = %key.step_id,
            "discarding completion with no outstanding dispatch"
        );
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
