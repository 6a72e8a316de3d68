use super::ConfigError;
use crate::dispatch::ParticipantRegistry;
use crate::participant::{
    InflightTable, Participant, QueueProxy, SubprocessParticipant, TimeoutPolicy,
};
use crate::transport::QueueTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Memory,
    Dir { root: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParticipantConfig {
    Echo {
        #[serde(default = "default_instances")]
        instances: usize,
    },
    Subprocess {
        program: String,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
        #[serde(default)]
        timeout_policy: TimeoutPolicy,
        #[serde(default = "default_instances")]
        instances: usize,
    },
    Queue {
        queue: String,
    },
}

impl ParticipantConfig {
    pub fn build(
        &self,
        transport: &Arc<QueueTransport>,
        inflight: &Arc<InflightTable>,
    ) -> Participant {
        match self {
            Self::Echo { .. } => Participant::Echo,
            Self::Subprocess {
                program,
                timeout_seconds,
                timeout_policy,
                ..
            } => Participant::Subprocess(SubprocessParticipant::new(
                program.clone(),
                Duration::from_secs(*timeout_seconds),
                *timeout_policy,
            )),
            Self::Queue { queue } => Participant::QueueProxy(QueueProxy::new(
                queue.clone(),
                Arc::clone(transport),
                Arc::clone(inflight),
            )),
        }
    }

    pub fn instances(&self) -> usize {
        match self {
            Self::Echo { instances } | Self::Subprocess { instances, .. } => *instances,
            Self::Queue { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub state_root: PathBuf,
    pub transport: TransportConfig,
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: String,
    #[serde(default = "default_reply_queue")]
    pub reply_queue: String,
    #[serde(default)]
    pub participants: BTreeMap<String, ParticipantConfig>,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be a non-empty path".to_string(),
            ));
        }
        if self.dispatch_queue.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`dispatch_queue` must be non-empty".to_string(),
            ));
        }
        if self.reply_queue.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`reply_queue` must be non-empty".to_string(),
            ));
        }
        for (name, participant) in &self.participants {
            if name.trim().is_empty() {
                return Err(ConfigError::Settings(
                    "participant names must be non-empty".to_string(),
                ));
            }
            if participant.instances() == 0 {
                return Err(ConfigError::Settings(format!(
                    "participant `{name}` must run at least one instance"
                )));
            }
            match participant {
                ParticipantConfig::Echo { .. } => {}
                ParticipantConfig::Subprocess {
                    program,
                    timeout_seconds,
                    ..
                } => {
                    if program.trim().is_empty() {
                        return Err(ConfigError::Settings(format!(
                            "participant `{name}` must set a worker program"
                        )));
                    }
                    if *timeout_seconds == 0 {
                        return Err(ConfigError::Settings(format!(
                            "participant `{name}` must allow the worker at least one second"
                        )));
                    }
                }
                ParticipantConfig::Queue { queue } => {
                    if queue.trim().is_empty() {
                        return Err(ConfigError::Settings(format!(
                            "participant `{name}` must name a queue"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn build_transport(&self) -> QueueTransport {
        match &self.transport {
            TransportConfig::Memory => QueueTransport::memory(),
            TransportConfig::Dir { root } => QueueTransport::dir(root),
        }
    }

    pub fn build_registry(
        &self,
        transport: &Arc<QueueTransport>,
        inflight: &Arc<InflightTable>,
    ) -> Result<ParticipantRegistry, ConfigError> {
        let mut registry = ParticipantRegistry::default();
        for (name, config) in &self.participants {
            registry
                .register(name.clone(), config.build(transport, inflight))
                .map_err(|err| ConfigError::Settings(err.to_string()))?;
        }
        Ok(registry)
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_instances() -> usize {
    1
}

fn default_dispatch_queue() -> String {
    "taskqueue".to_string()
}

fn default_reply_queue() -> String {
    "results".to_string()
}
