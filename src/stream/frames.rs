//! Streaming wire protocol
//!
//! Every message is a JSON object with a `type` tag and, for most types, a
//! `data` payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GenerationOverrides;
use crate::error::ValidationError;

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Frame {
    Start,
    Token {
        token: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    Complete {
        #[serde(rename = "inferenceTimeSeconds")]
        inference_time_seconds: f64,
        #[serde(rename = "totalTokens")]
        total_tokens: usize,
    },
    Error {
        message: String,
    },
    Pong,
}

impl Frame {
    pub fn token(token: impl Into<String>) -> Self {
        Frame::Token {
            token: token.into(),
            is_final: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// True for frames that end a session's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Complete { .. } | Frame::Error { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A generation request as received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub message: String,
    pub settings: GenerationOverrides,
}

/// Inbound client message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Generate(GenerateRequest),
    Ping,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct MessageData {
    #[serde(default)]
    message: String,
    #[serde(default)]
    settings: Option<GenerationOverrides>,
}

impl ClientMessage {
    /// Parse one inbound text message.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        match raw.kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "message" => {
                let data: MessageData = serde_json::from_value(raw.data)
                    .map_err(|e| ValidationError::Malformed(e.to_string()))?;
                if data.message.trim().is_empty() {
                    return Err(ValidationError::EmptyMessage);
                }
                Ok(ClientMessage::Generate(GenerateRequest {
                    message: data.message,
                    settings: data.settings.unwrap_or_default(),
                }))
            }
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}
