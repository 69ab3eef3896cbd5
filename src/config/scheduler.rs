//! Session scheduling settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits applied by the session scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock budget per running session in seconds (0 = unlimited)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Maximum sessions waiting for the engine
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// How long a reload waits for the running session to finish
    #[serde(default = "default_reload_drain")]
    pub reload_drain_secs: u64,
}

fn default_session_timeout() -> u64 {
    300
}

fn default_max_queued() -> usize {
    64
}

fn default_reload_drain() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            max_queued: default_max_queued(),
            reload_drain_secs: default_reload_drain(),
        }
    }
}

impl SchedulerConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    pub fn reload_drain(&self) -> Duration {
        Duration::from_secs(self.reload_drain_secs)
    }
}
