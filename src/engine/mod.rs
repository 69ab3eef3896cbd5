//! Core inference engine
//!
//! This module owns the inference-session lifecycle:
//! - Resource: the one compiled pipeline, device fallback, exclusive invocation
//! - Session: per-request state machine and cancellation
//! - Scheduler: FIFO admission onto the resource by a single serving worker

mod cancel;
mod device;
mod fallback;
mod resource;
mod scheduler;
mod session;

pub use cancel::CancelToken;
pub use device::{
    CacheMode, DeviceCandidate, DeviceId, DeviceKind, DeviceProfile, PerformanceHint,
};
pub use fallback::{DeviceFallbackResolver, Exhausted, Resolved};
pub use resource::{BindingMode, EngineResource, EngineState, EngineStatus, TokenStream};
pub use scheduler::{BatchOutcome, SessionScheduler, Submission};
pub use session::{SessionEvent, SessionHandle, SessionId, SessionStatus};
