//! Hearth - local LLM serving around one shared inference engine
//!
//! A single compiled model pipeline is bound to the first device in an
//! ordered plan that accepts it (falling back down the list), and many
//! clients share it through a FIFO session scheduler with one serving worker.
//!
//! # Architecture
//!
//! - **engine**: device fallback, the exclusive engine resource, sessions, scheduler
//! - **backend**: the opaque inference backend interface and its implementations
//! - **stream**: websocket frames, connection registry, per-client dispatch
//! - **server**: HTTP endpoints and the websocket transport
//! - **loader**: model artifact resolution and download
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! hearth serve --port 8000
//!
//! # One-shot generation
//! hearth generate "Hello"
//!
//! # Fetch the configured model
//! hearth pull
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod prompt;
pub mod server;
pub mod stream;
pub mod system;

// Re-export key types
pub use config::{GenerationConfig, HearthConfig, ServerConfig};
pub use engine::{EngineResource, SessionScheduler};
pub use error::{BackendError, EngineError, SchedulerError};
