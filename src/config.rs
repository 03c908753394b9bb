//! Coordinator configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::DeviceIdentity;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for the session coordinator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Public directories a restricted session is limited to.
    pub restricted_subdirs: Vec<String>,

    /// Logical name of the storage namespace the data view is bound to.
    pub volume_name: String,

    /// Identity strings the server reports to the host.
    pub device: DeviceIdentity,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            restricted_subdirs: vec!["DCIM".to_string(), "Pictures".to_string()],
            volume_name: "external".to_string(),
            device: DeviceIdentity::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
