//! Configuration system for hearth
//!
//! Configuration is read once at startup and treated as immutable. A model
//! reload re-runs engine initialization against the same configuration.

mod generation;
mod hardware;
mod model;
mod scheduler;
mod server;

pub use generation::{GenerationConfig, GenerationOverrides};
pub use hardware::{CpuSettings, GpuSettings, HardwareConfig, NpuSettings};
pub use model::ModelConfig;
pub use scheduler::SchedulerConfig;
pub use server::ServerConfig;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hearth configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HearthConfig {
    /// Model selection
    #[serde(default)]
    pub model: ModelConfig,

    /// Default generation settings
    #[serde(default, alias = "inference")]
    pub generation: GenerationConfig,

    /// Device order and compile settings
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// HTTP / websocket server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Session scheduling limits
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl HearthConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = read(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = read(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a YAML or JSON file chosen by extension.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path)?,
            _ => Self::from_yaml(path)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hardware.device_plan()?;
        self.generation
            .validate(self.model.max_context_length)
            .map_err(|e| ConfigError::Invalid(format!("generation: {e}")))?;
        if self.server.outbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.outbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
