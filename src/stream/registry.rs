//! Connected clients and their streaming channels

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use super::frames::Frame;
use super::ClientId;
use crate::config::GenerationConfig;
use crate::engine::{SessionEvent, SessionHandle, SessionId, SessionScheduler, Submission};
use crate::error::{DeliveryError, GenerationRejected};

struct ClientChannel {
    outbox: mpsc::Sender<Frame>,
    /// At most one session in flight per client
    current: Option<SessionHandle>,
}

/// Maps client identities to their outbound channels
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<ClientId, ClientChannel>>,
    scheduler: Arc<SessionScheduler>,
    token_delay: Duration,
    outbox_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(
        scheduler: Arc<SessionScheduler>,
        token_delay: Duration,
        outbox_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            scheduler,
            token_delay,
            outbox_capacity: outbox_capacity.max(1),
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, ClientChannel>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client, returning the receiving end of its outbox.
    pub fn register(&self, client: ClientId) -> mpsc::Receiver<Frame> {
        let (outbox, rx) = mpsc::channel(self.outbox_capacity);
        let replaced = self.clients().insert(
            client,
            ClientChannel {
                outbox,
                current: None,
            },
        );
        if let Some(old) = replaced.and_then(|c| c.current) {
            old.cancel();
        }
        tracing::info!(client = %client, "client connected");
        rx
    }

    /// Remove a client and cancel its in-flight session. Returns false if unknown.
    pub fn unregister(&self, client: ClientId) -> bool {
        let Some(channel) = self.clients().remove(&client) else {
            return false;
        };
        if let Some(session) = channel.current {
            tracing::info!(client = %client, session = %session.id(), "cancelling session of departed client");
            session.cancel();
        }
        tracing::info!(client = %client, "client disconnected");
        true
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session currently bound to `client`, if any
    pub fn current_session(&self, client: ClientId) -> Option<SessionHandle> {
        self.clients()
            .get(&client)
            .and_then(|c| c.current.clone())
    }

    /// Send one frame to a client.
    ///
    /// A closed transport unregisters the client, which cancels its session.
    pub async fn deliver(&self, client: ClientId, frame: Frame) -> Result<(), DeliveryError> {
        let outbox = self
            .clients()
            .get(&client)
            .map(|c| c.outbox.clone())
            .ok_or(DeliveryError::UnknownClient(client))?;

        if outbox.send(frame).await.is_err() {
            tracing::warn!(client = %client, "delivery failed, dropping client");
            self.unregister(client);
            return Err(DeliveryError::Closed(client));
        }
        Ok(())
    }

    /// Submit a generation for `client` and stream its events back as frames.
    pub fn start_generation(
        self: &Arc<Self>,
        client: ClientId,
        prompt: String,
        params: GenerationConfig,
    ) -> Result<SessionId, GenerationRejected> {
        let (handle, events) = {
            let mut clients = self.clients();
            let channel = clients
                .get_mut(&client)
                .ok_or(GenerationRejected::UnknownClient(client))?;
            if channel.current.is_some() {
                return Err(GenerationRejected::AlreadyGenerating);
            }

            let Submission { handle, events } = self.scheduler.submit(prompt, params)?;
            channel.current = Some(handle.clone());
            (handle, events)
        };

        let id = handle.id();
        tracing::info!(client = %client, session = %id, "generation started");
        tokio::spawn(Arc::clone(self).forward(client, handle, events));
        Ok(id)
    }

    /// Turn session events into frames for one client.
    async fn forward(
        self: Arc<Self>,
        client: ClientId,
        session: SessionHandle,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let frame = match event {
                SessionEvent::Started => Frame::Start,
                SessionEvent::Token(token) => {
                    if !self.token_delay.is_zero() {
                        tokio::time::sleep(self.token_delay).await;
                    }
                    Frame::token(token)
                }
                SessionEvent::Completed { tokens, elapsed } => Frame::Complete {
                    inference_time_seconds: elapsed.as_secs_f64(),
                    total_tokens: tokens,
                },
                SessionEvent::Error { message } => Frame::error(message),
            };

            // Free the client for its next request before it sees the terminal frame.
            if frame.is_terminal() {
                self.release(client, session.id());
            }
            if self.deliver(client, frame).await.is_err() {
                session.cancel();
                break;
            }
        }
        self.release(client, session.id());
    }

    fn release(&self, client: ClientId, session: SessionId) {
        if let Some(channel) = self.clients().get_mut(&client) {
            if channel.current.as_ref().map(|s| s.id()) == Some(session) {
                channel.current = None;
            }
        }
    }
}
