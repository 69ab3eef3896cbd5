//! Token streaming to connected clients
//!
//! - Frames: the JSON wire protocol
//! - Registry: client channels and session-to-client routing
//! - Dispatch: inbound message handling, shared by every transport

mod dispatch;
mod frames;
mod registry;

pub use dispatch::Dispatcher;
pub use frames::{ClientMessage, Frame, GenerateRequest};
pub use registry::ConnectionRegistry;

use std::fmt;

use uuid::Uuid;

/// Identity of one connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0.simple())
    }
}
