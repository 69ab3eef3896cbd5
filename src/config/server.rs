//! Server configuration settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP / websocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Enable request logging
    #[serde(default = "default_true")]
    pub request_logging: bool,

    /// Pause between streamed token frames, in milliseconds (0 = none)
    #[serde(default = "default_token_delay_ms")]
    pub token_delay_ms: u64,

    /// Frames buffered per client before delivery waits on the transport
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Queue batch requests behind running sessions instead of answering busy
    #[serde(default)]
    pub queue_batch_requests: bool,

    /// Log level or filter directive; `RUST_LOG` takes precedence
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_token_delay_ms() -> u64 {
    10
}

fn default_outbox_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_enabled: true,
            request_logging: true,
            token_delay_ms: default_token_delay_ms(),
            outbox_capacity: default_outbox_capacity(),
            queue_batch_requests: false,
            log_level: None,
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Filter directive for the log subscriber.
    ///
    /// A bare level (`DEBUG`, `warning`) applies to this crate and the HTTP
    /// layer; anything containing `=` or `,` is used as written.
    pub fn log_directive(&self) -> String {
        let level = self
            .log_level
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty());
        match level {
            Some(directive) if directive.contains('=') || directive.contains(',') => {
                directive.to_string()
            }
            Some(level) => {
                let level = match level.to_ascii_lowercase().as_str() {
                    "warning" => "warn".to_string(),
                    "critical" | "fatal" => "error".to_string(),
                    other => other.to_string(),
                };
                format!("hearth={level},tower_http={level}")
            }
            None => "hearth=info,tower_http=info".to_string(),
        }
    }

    pub fn token_delay(&self) -> Duration {
        Duration::from_millis(self.token_delay_ms)
    }
}
