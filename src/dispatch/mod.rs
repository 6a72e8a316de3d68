pub mod receiver;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::participant::{Consumption, InflightTable, Participant, ParticipantError};
use crate::transport::QueueTransport;
use crate::workitem::Workitem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Running,
    Draining,
    Stopped,
}

impl DispatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no participant registered under name {name}")]
    UnknownParticipant { name: String },
    #[error("participant {name} is already registered")]
    DuplicateParticipant { name: String },
    #[error("dispatcher is {phase}, not accepting workitems")]
    NotAccepting { phase: DispatchPhase },
    #[error("participant {name} failed: {source}")]
    Participant {
        name: String,
        #[source]
        source: ParticipantError,
    },
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    entries: BTreeMap<String, Participant>,
}

impl ParticipantRegistry {
    pub fn register(
        &mut self,
        name: String,
        participant: Participant,
    ) -> Result<(), DispatchError> {
        if self.entries.contains_key(&name) {
            return Err(DispatchError::DuplicateParticipant { name });
        }
        self.entries.insert(name, participant);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct PhaseState {
    phase: DispatchPhase,
    sync_in_flight: usize,
}

#[derive(Debug)]
pub struct Coordinator {
    registry: ParticipantRegistry,
    inflight: Arc<InflightTable>,
    state: Mutex<PhaseState>,
    phase_changed: Condvar,
    stop: Arc<AtomicBool>,
    receiver_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(registry: ParticipantRegistry, inflight: Arc<InflightTable>) -> Self {
        Self {
            registry,
            inflight,
            state: Mutex::new(PhaseState {
                phase: DispatchPhase::Running,
                sync_in_flight: 0,
            }),
            phase_changed: Condvar::new(),
            stop: Arc::new(AtomicBool::new(false)),
            receiver_handle: Mutex::new(None),
        }
    }

    pub fn route(&self, step_name: &str, workitem: &Workitem) -> Result<Consumption, DispatchError> {
        let Some(participant) = self.registry.get(step_name) else {
            return Err(DispatchError::UnknownParticipant {
                name: step_name.to_string(),
            });
        };
        {
            let mut state = self.lock_state();
            if state.phase != DispatchPhase::Running {
                return Err(DispatchError::NotAccepting { phase: state.phase });
            }
            state.sync_in_flight += 1;
        }
        let outcome = participant
            .consume(workitem)
            .map_err(|source| DispatchError::Participant {
                name: step_name.to_string(),
                source,
            });
        self.finish_route();
        outcome
    }

    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.phase != DispatchPhase::Running {
            return;
        }
        state.phase = DispatchPhase::Draining;
        self.stop.store(true, Ordering::SeqCst);
        info!(in_flight = state.sync_in_flight, "dispatcher draining");
        if state.sync_in_flight == 0 {
            self.finalize_locked(&mut state);
        }
        drop(state);
        self.phase_changed.notify_all();
    }

    pub fn join(&self) {
        let mut state = self.lock_state();
        while state.phase != DispatchPhase::Stopped {
            state = match self
                .phase_changed
                .wait_timeout(state, Duration::from_millis(200))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(state);
        let handle = match self.receiver_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn spawn_receiver(self: &Arc<Self>, transport: Arc<QueueTransport>, reply_queue: &str) {
        let coordinator = Arc::clone(self);
        let queue = reply_queue.to_string();
        let handle = std::thread::spawn(move || {
            receiver::run_receiver(coordinator, transport, queue);
        });
        match self.receiver_handle.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    pub fn phase(&self) -> DispatchPhase {
        self.lock_state().phase
    }

    pub fn has_participant(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn inflight(&self) -> &Arc<InflightTable> {
        &self.inflight
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn finish_route(&self) {
        let mut state = self.lock_state();
        state.sync_in_flight = state.sync_in_flight.saturating_sub(1);
        if state.phase == DispatchPhase::Draining && state.sync_in_flight == 0 {
            self.finalize_locked(&mut state);
        }
        drop(state);
        self.phase_changed.notify_all();
    }

    fn finalize_locked(&self, state: &mut PhaseState) {
        state.phase = DispatchPhase::Stopped;
        self.stop.store(true, Ordering::SeqCst);
        let abandoned = self.inflight.abandon_outstanding();
        for (key, dispatch) in &abandoned {
            warn!(
                instance = %key.instance_id,
                step = %key.step_id,
                waited_secs = now_secs().saturating_sub(dispatch.dispatched_at),
                "abandoning queue dispatch during shutdown"
            );
        }
        info!(abandoned = abandoned.len(), "dispatcher stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, PhaseState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
