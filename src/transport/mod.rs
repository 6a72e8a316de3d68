pub mod dir;
pub mod memory;

pub use dir::DirTransport;
pub use memory::MemoryTransport;

use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid queue name `{queue}`: {reason}")]
    InvalidQueue { queue: String, reason: String },
    #[error("transport io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub enum QueueTransport {
    Memory(MemoryTransport),
    Dir(DirTransport),
}

impl QueueTransport {
    pub fn memory() -> Self {
        Self::Memory(MemoryTransport::default())
    }

    pub fn dir(root: &Path) -> Self {
        Self::Dir(DirTransport::new(root))
    }

    pub fn publish(&self, queue: &str, body: &str) -> Result<(), TransportError> {
        validate_queue_name(queue)?;
        match self {
            Self::Memory(transport) => transport.publish(queue, body),
            Self::Dir(transport) => transport.publish(queue, body),
        }
    }

    pub fn receive(&self, queue: &str, wait: Duration) -> Result<Option<String>, TransportError> {
        validate_queue_name(queue)?;
        match self {
            Self::Memory(transport) => Ok(transport.receive(queue, wait)),
            Self::Dir(transport) => transport.receive(queue, wait),
        }
    }

    pub fn recover(&self) -> Result<(), TransportError> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::Dir(transport) => transport.recover(),
        }
    }
}

fn validate_queue_name(queue: &str) -> Result<(), TransportError> {
    if queue.is_empty() {
        return Err(TransportError::InvalidQueue {
            queue: queue.to_string(),
            reason: "queue name must be non-empty".to_string(),
        });
    }
    if queue
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(TransportError::InvalidQueue {
        queue: queue.to_string(),
        reason: "queue name must use only ASCII letters, digits, '-' or '_'".to_string(),
    })
}
