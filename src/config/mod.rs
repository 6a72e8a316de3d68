pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::{ParticipantConfig, Settings, TransportConfig};

use crate::engine::LaunchRequest;
use std::path::Path;

pub fn load_launch_request(path: &Path) -> Result<LaunchRequest, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
