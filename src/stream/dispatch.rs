//! Per-message handling for streaming clients, independent of the transport

use std::sync::Arc;

use super::frames::{ClientMessage, Frame};
use super::registry::ConnectionRegistry;
use super::ClientId;
use crate::config::GenerationConfig;
use crate::prompt::ChatTemplate;

/// Applies inbound client messages to the registry
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    defaults: GenerationConfig,
    max_context_len: usize,
    template: ChatTemplate,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        defaults: GenerationConfig,
        max_context_len: usize,
        template: ChatTemplate,
    ) -> Self {
        Self {
            registry,
            defaults,
            max_context_len,
            template,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one inbound text message from `client`.
    ///
    /// Every rejection is answered with an error frame; the connection stays open.
    pub async fn handle_text(&self, client: ClientId, text: &str) {
        let reply = match ClientMessage::parse(text) {
            Ok(ClientMessage::Ping) => Some(Frame::Pong),
            Ok(ClientMessage::Generate(request)) => {
                match self
                    .defaults
                    .with_overrides(&request.settings, self.max_context_len)
                {
                    Ok(params) => {
                        let prompt = self.template.render(&request.message);
                        match self.registry.start_generation(client, prompt, params) {
                            Ok(_) => None,
                            Err(err) => {
                                tracing::warn!(client = %client, error = %err, "generation rejected");
                                Some(Frame::error(err.to_string()))
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(client = %client, error = %err, "invalid settings");
                        Some(Frame::error(err.to_string()))
                    }
                }
            }
            Err(err) => {
                tracing::debug!(client = %client, error = ?err, "invalid message");
                Some(Frame::error(err.to_string()))
            }
        };

        if let Some(frame) = reply {
            // Failures unregister the client; nothing else to do here.
            let _ = self.registry.deliver(client, frame).await;
        }
    }

    /// Answer a message the protocol has no use for, such as binary data.
    pub async fn reject_unsupported(&self, client: ClientId) {
        tracing::debug!(client = %client, "non-text message rejected");
        let _ = self
            .registry
            .deliver(client, Frame::error("Invalid message format"))
            .await;
    }
}
