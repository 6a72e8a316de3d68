use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dispatch::{Coordinator, DispatchError, DispatchPhase};
use crate::participant::{Consumption, CorrelationKey};
use crate::shared::new_instance_id;
use crate::workitem::Workitem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub participant: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub definition: ProcessDefinition,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Active,
    Completed(Workitem),
    Abandoned { step_id: String },
    Failed { step_id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is {phase}, not launching instances")]
    NotAccepting { phase: DispatchPhase },
    #[error("definition {definition} names unregistered participant {name}")]
    UnknownParticipant { definition: String, name: String },
}

#[derive(Debug)]
pub struct Engine {
    coordinator: Arc<Coordinator>,
    runs: Mutex<BTreeMap<String, RunState>>,
    runs_changed: Condvar,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            runs: Mutex::new(BTreeMap::new()),
            runs_changed: Condvar::new(),
            drivers: Mutex::new(Vec::new()),
        }
    }

    pub fn launch(
        self: &Arc<Self>,
        definition: ProcessDefinition,
        initial_fields: Map<String, Value>,
    ) -> Result<String, EngineError> {
        let phase = self.coordinator.phase();
        if phase != DispatchPhase::Running {
            return Err(EngineError::NotAccepting { phase });
        }
        for step in &definition.steps {
            if !self.coordinator.has_participant(&step.participant) {
                return Err(EngineError::UnknownParticipant {
                    definition: definition.name.clone(),
                    name: step.participant.clone(),
                });
            }
        }
        let instance_id = {
            let mut runs = self.lock_runs();
            let instance_id = allocate_instance_id(&runs, new_instance_id);
            runs.insert(instance_id.clone(), RunState::Active);
            instance_id
        };
        info!(
            definition = %definition.name,
            instance = %instance_id,
            steps = definition.steps.len(),
            "launching process instance"
        );
        let engine = Arc::clone(self);
        let run_id = instance_id.clone();
        let handle = std::thread::spawn(move || {
            drive_process(engine, run_id, definition, initial_fields);
        });
        self.lock_drivers().push(handle);
        Ok(instance_id)
    }

    pub fn wait_result(&self, instance_id: &str, timeout: Duration) -> Option<Workitem> {
        let deadline = Instant::now() + timeout;
        let mut runs = self.lock_runs();
        loop {
            match runs.get(instance_id) {
                Some(RunState::Completed(result)) => return Some(result.clone()),
                Some(RunState::Active) => {}
                Some(_) | None => return None,
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            runs = match self.runs_changed.wait_timeout(runs, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn run_state(&self, instance_id: &str) -> Option<RunState> {
        self.lock_runs().get(instance_id).cloned()
    }

    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_drivers().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn set_run_state(&self, instance_id: &str, state: RunState) {
        let mut runs = self.lock_runs();
        runs.insert(instance_id.to_string(), state);
        drop(runs);
        self.runs_changed.notify_all();
    }

    fn lock_runs(&self) -> MutexGuard<'_, BTreeMap<String, RunState>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_drivers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.drivers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn allocate_instance_id<F>(runs: &BTreeMap<String, RunState>, mut generate: F) -> String
where
    F: FnMut() -> String,
{
    let mut instance_id = generate();
    while runs.contains_key(&instance_id) {
        instance_id = generate();
    }
    instance_id
}

fn drive_process(
    engine: Arc<Engine>,
    instance_id: String,
    definition: ProcessDefinition,
    initial_fields: Map<String, Value>,
) {
    let mut fields = initial_fields;
    let mut last = Workitem::new(&instance_id, fields.clone());
    for (index, step) in definition.steps.iter().enumerate() {
        let mut workitem = Workitem::new(&instance_id, fields.clone());
        workitem.params = step.params.clone();
        workitem.participant_name = step.participant.clone();
        workitem.step_id = index.to_string();
        let key = CorrelationKey::of(&workitem);
        match engine.coordinator.route(&step.participant, &workitem) {
            Ok(Consumption::Completed(result)) => {
                fields = result.fields.clone();
                last = result;
            }
            Ok(Consumption::Pending) => match engine.coordinator.inflight().wait_completed(&key) {
                Some(result) => {
                    fields = result.fields.clone();
                    last = result;
                }
                None => {
                    warn!(
                        instance = %instance_id,
                        step = %key.step_id,
                        "instance abandoned while waiting on queue participant"
                    );
                    engine.set_run_state(
                        &instance_id,
                        RunState::Abandoned {
                            step_id: key.step_id,
                        },
                    );
                    return;
                }
            },
            Err(DispatchError::NotAccepting { .. }) => {
                warn!(
                    instance = %instance_id,
                    step = %key.step_id,
                    "instance abandoned, dispatcher no longer accepting"
                );
                engine.set_run_state(
                    &instance_id,
                    RunState::Abandoned {
                        step_id: key.step_id,
                    },
                );
                return;
            }
            Err(err) => {
                warn!(
                    instance = %instance_id,
                    step = %key.step_id,
                    error = %err,
                    "instance failed"
                );
                engine.set_run_state(
                    &instance_id,
                    RunState::Failed {
                        step_id: key.step_id,
                        reason: err.to_string(),
                    },
                );
                return;
            }
        }
    }
    info!(instance = %instance_id, "process instance completed");
    engine.set_run_state(&instance_id, RunState::Completed(last));
}
