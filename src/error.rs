//! Error taxonomy
//!
//! Per-session failures (backend, delivery, validation) never escalate past
//! the session that caused them. Only an exhausted device fallback is fatal
//! to serving.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::{EngineState, SessionId};
use crate::stream::ClientId;

/// Failure reported by an inference backend
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The device class cannot run this model at all
    #[error("{device} cannot run this model: {reason}")]
    Capability { device: String, reason: String },

    /// The device can run the model but lacks memory or compute headroom
    #[error("{device} lacks capacity: {reason}")]
    Capacity { device: String, reason: String },

    /// Compiling or loading the pipeline failed for another reason
    #[error("failed to load model on {device}: {reason}")]
    Load { device: String, reason: String },

    /// Failure while producing tokens
    #[error("generation failed: {0}")]
    Generation(String),
}

impl BackendError {
    /// Failures that are expected to trigger a fallback to the next device
    pub fn is_device_specific(&self) -> bool {
        matches!(
            self,
            BackendError::Capability { .. } | BackendError::Capacity { .. }
        )
    }
}

/// Model artifact resolution failure
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("failed to download '{repo}': {reason}")]
    Network { repo: String, reason: String },

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("downloaded '{repo}' but {missing} is still missing")]
    Incomplete { repo: String, missing: String },
}

/// Engine-level failure
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not ready (state: {state})")]
    NotReady { state: EngineState },

    #[error("engine busy with {active}")]
    Busy { active: SessionId },

    #[error("model artifact unavailable: {0}")]
    Artifact(#[from] DownloadError),

    #[error("no device could load the model: {0}")]
    Initialization(String),

    #[error("reload refused: {0}")]
    ReloadRefused(String),
}

/// Rejection of a submission by the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("model not ready (state: {0})")]
    NotReady(EngineState),

    #[error("engine is busy, retry later")]
    Busy,

    #[error("queue is full ({0} sessions waiting)")]
    QueueFull(usize),

    #[error("scheduler has stopped")]
    Stopped,
}

impl From<EngineError> for SchedulerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotReady { state } => SchedulerError::NotReady(state),
            EngineError::Busy { .. } => SchedulerError::Busy,
            _ => SchedulerError::Stopped,
        }
    }
}

/// Malformed or out-of-range client input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid JSON format")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Empty message")]
    EmptyMessage,

    #[error("{field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

/// Transport-level send failure toward a client
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),

    #[error("channel to client {0} is closed")]
    Closed(ClientId),
}

/// Why a streaming generation request was refused
#[derive(Debug, Error)]
pub enum GenerationRejected {
    #[error("already generating")]
    AlreadyGenerating,

    #[error("client {0} is not connected")]
    UnknownClient(ClientId),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Configuration loading or validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_specific_classification() {
        let cap = BackendError::Capability {
            device: "npu".into(),
            reason: "dynamic shapes".into(),
        };
        let load = BackendError::Load {
            device: "cpu".into(),
            reason: "corrupt weights".into(),
        };
        assert!(cap.is_device_specific());
        assert!(!load.is_device_specific());
        assert!(!BackendError::Generation("boom".into()).is_device_specific());
    }

    #[test]
    fn test_validation_messages_match_wire_text() {
        assert_eq!(ValidationError::EmptyMessage.to_string(), "Empty message");
        assert_eq!(
            ValidationError::UnknownType("foo".into()).to_string(),
            "Unknown message type: foo"
        );
        assert_eq!(
            GenerationRejected::AlreadyGenerating.to_string(),
            "already generating"
        );
    }
}
