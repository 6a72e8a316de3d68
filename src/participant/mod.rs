pub mod echo;
pub mod queue_proxy;
pub mod subprocess;

pub use queue_proxy::{CorrelationKey, InflightDispatch, InflightTable, QueueProxy};
pub use subprocess::{SubprocessParticipant, TimeoutPolicy};

use crate::transport::TransportError;
use crate::workitem::{Workitem, WorkitemError};

#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    #[error("failed to encode workitem for participant {participant}: {source}")]
    Encode {
        participant: String,
        #[source]
        source: WorkitemError,
    },
    #[error("worker program missing for participant {participant}: {program}")]
    MissingProgram {
        participant: String,
        program: String,
    },
    #[error("worker io failure for participant {participant} during {stage}: {source}")]
    Io {
        participant: String,
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("worker for participant {participant} timed out after {timeout_ms}ms")]
    Timeout {
        participant: String,
        timeout_ms: u64,
    },
    #[error("worker reply for participant {participant} failed to decode: {source}")]
    MalformedReply {
        participant: String,
        #[source]
        source: WorkitemError,
    },
    #[error("worker reply for participant {participant} answered for {field} {found}, expected {expected}")]
    ReplyIdentity {
        participant: String,
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("failed to publish workitem to queue {queue}: {source}")]
    Publish {
        queue: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Consumption {
    Completed(Workitem),
    Pending,
}

#[derive(Debug)]
pub enum Participant {
    Echo,
    Subprocess(SubprocessParticipant),
    QueueProxy(QueueProxy),
}

impl Participant {
    pub fn consume(&self, workitem: &Workitem) -> Result<Consumption, ParticipantError> {
        match self {
            Self::Echo => Ok(Consumption::Completed(echo::consume(workitem))),
            Self::Subprocess(participant) => {
                participant.consume(workitem).map(Consumption::Completed)
            }
            Self::QueueProxy(proxy) => proxy.dispatch(workitem).map(|()| Consumption::Pending),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Subprocess(_) => "subprocess",
            Self::QueueProxy(_) => "queue",
        }
    }
}
