//! Generation sessions
//!
//! A session is one logical generation request. Its status only moves
//! forward: `Queued -> Running -> {Completed, Failed, Cancelled}`, or
//! `Queued -> Cancelled` when it is cancelled before admission.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::cancel::CancelToken;
use crate::config::GenerationConfig;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    fn can_become(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }
}

/// Event produced by the serving worker for one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session was admitted onto the engine
    Started,
    Token(String),
    Completed { tokens: usize, elapsed: Duration },
    /// Backend failure or timeout; no further events follow
    Error { message: String },
}

#[derive(Debug, Default)]
struct Timing {
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

/// State shared between the scheduler and every handle to a session
#[derive(Debug)]
pub(crate) struct SessionShared {
    id: SessionId,
    status: watch::Sender<SessionStatus>,
    cancel: CancelToken,
    tokens_emitted: AtomicUsize,
    submitted_at: Instant,
    timing: Mutex<Timing>,
}

impl SessionShared {
    fn new(id: SessionId) -> Self {
        let (status, _) = watch::channel(SessionStatus::Queued);
        Self {
            id,
            status,
            cancel: CancelToken::new(),
            tokens_emitted: AtomicUsize::new(0),
            submitted_at: Instant::now(),
            timing: Mutex::new(Timing::default()),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Apply a status transition. Returns false if it is not allowed from the current status.
    pub(crate) fn transition(&self, next: SessionStatus) -> bool {
        self.apply(|current| current.can_become(next), next)
    }

    /// Like `transition`, but only when the current status is exactly `from`.
    pub(crate) fn transition_from(&self, from: SessionStatus, next: SessionStatus) -> bool {
        self.apply(|current| current == from && current.can_become(next), next)
    }

    fn apply(&self, allowed: impl Fn(SessionStatus) -> bool, next: SessionStatus) -> bool {
        let moved = self.status.send_if_modified(|current| {
            if allowed(*current) {
                *current = next;
                true
            } else {
                false
            }
        });

        if moved {
            let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if next == SessionStatus::Running {
                timing.started_at = Some(now);
            } else if next.is_terminal() {
                timing.ended_at = Some(now);
            }
            tracing::debug!(session = %self.id, status = ?next, "session status changed");
        }
        moved
    }

    pub(crate) fn tokens_emitted(&self) -> usize {
        self.tokens_emitted.load(Ordering::SeqCst)
    }

    pub(crate) fn record_token(&self) -> usize {
        self.tokens_emitted.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Time spent running, or since submission if never admitted
    pub(crate) fn elapsed(&self) -> Duration {
        let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        let start = timing.started_at.unwrap_or(self.submitted_at);
        match timing.ended_at {
            Some(end) => end.duration_since(start),
            None => start.elapsed(),
        }
    }
}

/// Client-side view of a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn tokens_emitted(&self) -> usize {
        self.shared.tokens_emitted()
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.elapsed()
    }

    /// Cancel the session.
    ///
    /// A queued session becomes `Cancelled` immediately and never reaches the
    /// backend. A running session stops consuming tokens at the next token
    /// boundary; the backend call itself is only interrupted if it polls the flag.
    pub fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.shared.cancel.cancel();
        if self
            .shared
            .transition_from(SessionStatus::Queued, SessionStatus::Cancelled)
        {
            tracing::info!(session = %self.id(), "queued session cancelled");
        }
    }

    /// Wait until the session reaches a terminal status.
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.shared.status.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }
}

/// A session as owned by the scheduler until it is retired
pub(crate) struct GenerationSession {
    pub shared: Arc<SessionShared>,
    pub prompt: String,
    pub params: GenerationConfig,
    pub sink: mpsc::Sender<SessionEvent>,
}

impl GenerationSession {
    /// Create a queued session and the receiving end of its event stream.
    pub fn new(
        prompt: String,
        params: GenerationConfig,
        event_capacity: usize,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let shared = Arc::new(SessionShared::new(SessionId::next()));
        let (sink, events) = mpsc::channel(event_capacity.max(1));
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };
        let session = Self {
            shared,
            prompt,
            params,
            sink,
        };
        (session, handle, events)
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }
}
