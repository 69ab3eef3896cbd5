//! Session scheduler
//!
//! Admits sessions onto the single engine, strictly first in, first out.
//! One serving worker owns admission; it is the only caller of
//! [`EngineResource::invoke`], so at most one session runs at a time.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use super::resource::{EngineResource, EngineState, TokenStream};
use super::session::{GenerationSession, SessionEvent, SessionHandle, SessionStatus};
use crate::config::{GenerationConfig, SchedulerConfig};
use crate::error::{EngineError, SchedulerError};

/// Events buffered per session between the worker and its consumer
const EVENT_BUFFER: usize = 64;

/// How long the worker waits for room to send a session's terminal event
const FINAL_GRACE: Duration = Duration::from_secs(2);

/// An accepted session and its event stream
pub struct Submission {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Result of a batch (non-streaming) generation
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub full_text: String,
    pub tokens_emitted: usize,
    pub elapsed: Duration,
    /// Failure description when the session did not complete
    pub error: Option<String>,
}

/// FIFO admission of generation sessions onto one engine
pub struct SessionScheduler {
    engine: Arc<EngineResource>,
    queue: mpsc::UnboundedSender<GenerationSession>,
    /// Sessions submitted and not yet retired by the worker
    pending: Arc<AtomicUsize>,
    config: SchedulerConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionScheduler {
    /// Create the scheduler and spawn its serving worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(engine: Arc<EngineResource>, config: SchedulerConfig) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(serve(
            Arc::clone(&engine),
            rx,
            Arc::clone(&pending),
            config.session_timeout(),
        ));

        Arc::new(Self {
            engine,
            queue,
            pending,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn engine(&self) -> &Arc<EngineResource> {
        &self.engine
    }

    /// Sessions waiting or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue a session behind any already waiting.
    pub fn submit(
        &self,
        prompt: String,
        params: GenerationConfig,
    ) -> Result<Submission, SchedulerError> {
        self.check_serving()?;
        let limit = self.config.max_queued + 1;
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| SchedulerError::QueueFull(self.config.max_queued))?;
        self.enqueue(prompt, params)
    }

    /// Submit only if nothing is waiting or running; otherwise report busy.
    pub fn try_submit(
        &self,
        prompt: String,
        params: GenerationConfig,
    ) -> Result<Submission, SchedulerError> {
        self.check_serving()?;
        self.pending
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SchedulerError::Busy)?;
        self.enqueue(prompt, params)
    }

    fn check_serving(&self) -> Result<(), SchedulerError> {
        let state = self.engine.state();
        if state.is_serving() {
            Ok(())
        } else {
            Err(SchedulerError::NotReady(state))
        }
    }

    fn enqueue(
        &self,
        prompt: String,
        params: GenerationConfig,
    ) -> Result<Submission, SchedulerError> {
        let (session, handle, events) = GenerationSession::new(prompt, params, EVENT_BUFFER);
        let id = session.id();
        if self.queue.send(session).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::Stopped);
        }
        tracing::info!(session = %id, pending = self.pending(), "session queued");
        Ok(Submission { handle, events })
    }

    /// Run a session to completion and collect its output.
    ///
    /// Uses the same serving path as streaming. With `queue` false, a busy
    /// engine is reported instead of waiting. Dropping the returned future
    /// cancels the session.
    pub async fn generate_collect(
        &self,
        prompt: String,
        params: GenerationConfig,
        queue: bool,
    ) -> Result<BatchOutcome, SchedulerError> {
        let Submission { handle, mut events } = if queue {
            self.submit(prompt, params)?
        } else {
            self.try_submit(prompt, params)?
        };
        let _cancel_on_drop = CancelOnDrop(handle.clone());

        let mut full_text = String::new();
        let mut delivered = 0;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Started => {}
                SessionEvent::Token(token) => {
                    full_text.push_str(&token);
                    delivered += 1;
                }
                SessionEvent::Completed { tokens, elapsed } => {
                    return Ok(BatchOutcome {
                        full_text,
                        tokens_emitted: tokens,
                        elapsed,
                        error: None,
                    });
                }
                SessionEvent::Error { message } => {
                    return Ok(BatchOutcome {
                        full_text,
                        tokens_emitted: delivered,
                        elapsed: handle.elapsed(),
                        error: Some(message),
                    });
                }
            }
        }

        Ok(BatchOutcome {
            full_text,
            tokens_emitted: delivered,
            elapsed: handle.elapsed(),
            error: Some("generation cancelled".to_string()),
        })
    }

    /// Wait up to `drain` for the running session to finish, then reload the engine.
    pub async fn reload(&self, drain: Duration) -> Result<EngineState, EngineError> {
        if !self.engine.wait_idle(drain).await {
            let active = self
                .engine
                .active_session()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "a session".to_string());
            return Err(EngineError::ReloadRefused(format!(
                "{active} still running after {}s",
                drain.as_secs()
            )));
        }
        self.engine.reload().await
    }

    /// Stop the serving worker. Queued sessions are dropped.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
            tracing::info!("session scheduler stopped");
        }
    }
}

struct CancelOnDrop(SessionHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// The serving worker: one session at a time, in arrival order.
async fn serve(
    engine: Arc<EngineResource>,
    mut queue: mpsc::UnboundedReceiver<GenerationSession>,
    pending: Arc<AtomicUsize>,
    timeout: Option<Duration>,
) {
    while let Some(session) = queue.recv().await {
        run_session(&engine, session, timeout).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("serving worker exiting");
}

enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
    TimedOut(Duration),
}

async fn run_session(engine: &EngineResource, session: GenerationSession, timeout: Option<Duration>) {
    let id = session.id();
    let shared = Arc::clone(&session.shared);
    let cancel = shared.cancel_token().clone();

    if shared.status() != SessionStatus::Queued || cancel.is_cancelled() {
        tracing::debug!(session = %id, "skipping cancelled session");
        return;
    }

    // A reload in progress keeps queued sessions queued.
    engine.settled().await;
    if !shared.transition_from(SessionStatus::Queued, SessionStatus::Running) {
        tracing::debug!(session = %id, "session cancelled before admission");
        return;
    }

    let mut stream = loop {
        let invoked = engine.invoke(
            id,
            session.prompt.clone(),
            session.params.clone(),
            cancel.clone(),
        );
        match invoked {
            Ok(stream) => break stream,
            Err(_) if cancel.is_cancelled() => {
                shared.transition(SessionStatus::Cancelled);
                return;
            }
            Err(EngineError::NotReady {
                state: EngineState::Loading,
            }) => {
                tracing::debug!(session = %id, "engine reloading, waiting to admit");
                engine.settled().await;
            }
            Err(err) => {
                tracing::error!(session = %id, error = %err, "engine refused session");
                shared.transition(SessionStatus::Failed);
                let message = match err {
                    EngineError::NotReady { state } => SchedulerError::NotReady(state).to_string(),
                    other => other.to_string(),
                };
                deliver_final(&session, SessionEvent::Error { message }).await;
                return;
            }
        }
    };

    tracing::info!(session = %id, "session running");
    let outcome = pump(&session, &mut stream, timeout).await;

    // The client hears about a timeout now, not once the backend lets go.
    if let Outcome::TimedOut(budget) = outcome {
        shared.transition(SessionStatus::Cancelled);
        tracing::warn!(
            session = %id,
            tokens = shared.tokens_emitted(),
            budget_s = budget.as_secs(),
            "session timed out"
        );
        let message = format!("generation timed out after {}s", budget.as_secs());
        deliver_final(&session, SessionEvent::Error { message }).await;
    }

    let finished = stream.finish().await;
    let outcome = match (outcome, finished) {
        (Outcome::Completed, Err(err)) => Outcome::Failed(err.to_string()),
        (outcome, _) => outcome,
    };

    let tokens = shared.tokens_emitted();
    match outcome {
        Outcome::Completed => {
            shared.transition(SessionStatus::Completed);
            let elapsed = shared.elapsed();
            tracing::info!(session = %id, tokens, elapsed_ms = elapsed.as_millis() as u64, "session completed");
            deliver_final(&session, SessionEvent::Completed { tokens, elapsed }).await;
        }
        Outcome::Failed(message) => {
            shared.transition(SessionStatus::Failed);
            tracing::error!(session = %id, tokens, error = %message, "session failed");
            deliver_final(&session, SessionEvent::Error { message }).await;
        }
        Outcome::TimedOut(_) => {}
        Outcome::Cancelled => {
            shared.transition(SessionStatus::Cancelled);
            tracing::info!(session = %id, tokens, "session cancelled");
        }
    }
}

/// Announce the session, then pull tokens from the engine and push them to
/// the session's sink.
///
/// Every wait, including waiting for room in the sink, yields to cancellation
/// and to the session deadline.
async fn pump(
    session: &GenerationSession,
    stream: &mut TokenStream,
    timeout: Option<Duration>,
) -> Outcome {
    let max_tokens = session.params.max_tokens;
    let deadline = tokio::time::sleep_until(match timeout {
        Some(budget) => Instant::now() + budget,
        None => far_future(),
    });
    tokio::pin!(deadline);

    if let Err(outcome) = forward(session, SessionEvent::Started, deadline.as_mut(), timeout).await {
        return outcome;
    }

    let cancel = session.shared.cancel_token();
    let mut emitted = 0;
    loop {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = deadline.as_mut(), if timeout.is_some() => return expire(session, timeout),
            item = stream.next() => match item {
                Some(Ok(token)) => token,
                Some(Err(err)) => return Outcome::Failed(err.to_string()),
                None => return Outcome::Completed,
            }
        };

        tracing::trace!(session = %session.id(), token = %token, "token");
        if let Err(outcome) = forward(session, SessionEvent::Token(token), deadline.as_mut(), timeout).await {
            return outcome;
        }
        session.shared.record_token();
        emitted += 1;
        if emitted >= max_tokens {
            return Outcome::Completed;
        }
    }
}

/// Wait for room in the sink and send `event`, unless the session is
/// cancelled or its deadline passes first.
async fn forward(
    session: &GenerationSession,
    event: SessionEvent,
    deadline: Pin<&mut Sleep>,
    timeout: Option<Duration>,
) -> Result<(), Outcome> {
    let cancel = session.shared.cancel_token();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Outcome::Cancelled),
        _ = deadline, if timeout.is_some() => Err(expire(session, timeout)),
        permit = session.sink.reserve() => match permit {
            Ok(permit) => {
                permit.send(event);
                Ok(())
            }
            Err(_) => {
                tracing::warn!(session = %session.id(), "session consumer went away");
                cancel.cancel();
                Err(Outcome::Cancelled)
            }
        }
    }
}

fn expire(session: &GenerationSession, timeout: Option<Duration>) -> Outcome {
    session.shared.cancel_token().cancel();
    Outcome::TimedOut(timeout.unwrap_or_default())
}

/// Send a terminal event, giving a stalled consumer [`FINAL_GRACE`] to make room.
async fn deliver_final(session: &GenerationSession, event: SessionEvent) {
    match tokio::time::timeout(FINAL_GRACE, session.sink.reserve()).await {
        Ok(Ok(permit)) => permit.send(event),
        Ok(Err(_)) => {}
        Err(_) => tracing::warn!(session = %session.id(), "terminal event dropped, consumer not reading"),
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{serving_engine, PresentArtifact, Script, ScriptedBackend};
    use crate::config::ModelConfig;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i} ")).collect()
    }

    fn slow(n: usize, delay_ms: u64) -> ScriptedBackend {
        ScriptedBackend::new(Script {
            tokens: tokens(n),
            token_delay: Duration::from_millis(delay_ms),
            ..Default::default()
        })
    }

    async fn scheduler(backend: &ScriptedBackend) -> Arc<SessionScheduler> {
        SessionScheduler::start(serving_engine(backend).await, SchedulerConfig::default())
    }

    async fn collect(mut events: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    fn token_texts(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tokens_delivered_in_order_and_counted() {
        let backend = ScriptedBackend::with_tokens(&["Hello", ", ", "world", "!"]);
        let scheduler = scheduler(&backend).await;

        let Submission { handle, events } = scheduler
            .submit("hi".into(), GenerationConfig::default())
            .unwrap();
        let events = collect(events).await;

        assert_eq!(events.first(), Some(&SessionEvent::Started));
        assert_eq!(token_texts(&events), vec!["Hello", ", ", "world", "!"]);
        match events.last() {
            Some(SessionEvent::Completed { tokens, .. }) => assert_eq!(*tokens, 4),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(handle.wait().await, SessionStatus::Completed);
        assert_eq!(handle.tokens_emitted(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_never_overlap() {
        let backend = slow(5, 2);
        let scheduler = scheduler(&backend).await;

        let mut submissions = Vec::new();
        for i in 0..8 {
            let submission = scheduler
                .submit(format!("prompt {i}"), GenerationConfig::default())
                .unwrap();
            submissions.push(submission);
        }

        let waits: Vec<_> = submissions
            .into_iter()
            .map(|Submission { handle, events }| {
                tokio::spawn(async move { (handle, collect(events).await) })
            })
            .collect();
        for wait in waits {
            let (handle, events) = wait.await.unwrap();
            assert_eq!(handle.status(), SessionStatus::Completed);
            assert_eq!(token_texts(&events).len(), 5);
        }

        assert_eq!(backend.recorder.max_in_flight(), 1);
        assert_eq!(backend.recorder.generations(), 8);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_served_in_arrival_order() {
        let backend = slow(2, 5);
        let scheduler = scheduler(&backend).await;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let Submission { handle, events } = scheduler
                .submit("p".into(), GenerationConfig::default())
                .unwrap();
            ids.push(handle.id());
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                collect(events).await;
                let _ = done_tx.send(handle.id());
            });
        }
        drop(done_tx);

        let mut order = Vec::new();
        while let Some(id) = done_rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, ids);
    }

    #[tokio::test]
    async fn test_cancelled_queued_session_never_reaches_backend() {
        let backend = slow(10, 10);
        let scheduler = scheduler(&backend).await;

        let first = scheduler
            .submit("first".into(), GenerationConfig::default())
            .unwrap();
        let second = scheduler
            .submit("second".into(), GenerationConfig::default())
            .unwrap();

        second.handle.cancel();
        assert_eq!(second.handle.status(), SessionStatus::Cancelled);

        let first_events = collect(first.events).await;
        assert_eq!(token_texts(&first_events).len(), 10);
        assert!(collect(second.events).await.is_empty());

        // Let the worker retire the cancelled session.
        let third = scheduler
            .submit("third".into(), GenerationConfig::default())
            .unwrap();
        collect(third.events).await;
        assert_eq!(backend.recorder.generations(), 2);
        assert_eq!(second.handle.tokens_emitted(), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_session_with_one_error() {
        let backend = ScriptedBackend::new(Script {
            tokens: tokens(5),
            fail_after: Some(2),
            ..Default::default()
        });
        let scheduler = scheduler(&backend).await;

        let Submission { handle, events } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        let events = collect(events).await;

        assert_eq!(token_texts(&events).len(), 2);
        assert!(matches!(events.last(), Some(SessionEvent::Error { .. })));
        let errors = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Completed { .. })));
        assert_eq!(handle.status(), SessionStatus::Failed);

        // The engine is free for the next session.
        let next = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        assert_eq!(token_texts(&collect(next.events).await).len(), 2);
    }

    #[tokio::test]
    async fn test_running_cancel_stops_without_completion() {
        let backend = slow(200, 5);
        let scheduler = scheduler(&backend).await;

        let Submission { handle, mut events } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Started));
        assert!(matches!(events.recv().await, Some(SessionEvent::Token(_))));

        handle.cancel();
        let rest = collect(events).await;
        assert!(!rest.iter().any(|e| matches!(
            e,
            SessionEvent::Completed { .. } | SessionEvent::Error { .. }
        )));
        assert_eq!(handle.wait().await, SessionStatus::Cancelled);
        assert_eq!(scheduler.engine().active_session(), None);
    }

    #[tokio::test]
    async fn test_session_timeout_reports_error_and_cancels() {
        let backend = slow(100, 50);
        let engine = serving_engine(&backend).await;
        let scheduler = SessionScheduler::start(
            engine,
            SchedulerConfig {
                session_timeout_secs: 1,
                ..Default::default()
            },
        );

        let Submission { handle, events } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        let events = collect(events).await;

        match events.last() {
            Some(SessionEvent::Error { message }) => assert!(message.contains("timed out")),
            other => panic!("expected timeout error, got {other:?}"),
        }
        assert!(token_texts(&events).len() < 100);
        assert_eq!(handle.status(), SessionStatus::Cancelled);
    }

    fn timed_scheduler(engine: Arc<EngineResource>, secs: u64) -> Arc<SessionScheduler> {
        SessionScheduler::start(
            engine,
            SchedulerConfig {
                session_timeout_secs: secs,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_cancel_frees_worker_when_consumer_stops_reading() {
        let backend = ScriptedBackend::new(Script {
            tokens: tokens(500),
            ..Default::default()
        });
        let scheduler = timed_scheduler(serving_engine(&backend).await, 1);

        // Nobody reads these events; the sink fills and stays full.
        let Submission {
            handle,
            events: _stalled,
        } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();

        let status = tokio::time::timeout(Duration::from_millis(500), handle.wait())
            .await
            .expect("worker stuck on a full sink");
        assert_eq!(status, SessionStatus::Cancelled);
        assert!(handle.tokens_emitted() <= EVENT_BUFFER);

        let next = scheduler
            .submit("next".into(), GenerationConfig::default())
            .unwrap();
        let events = tokio::time::timeout(Duration::from_secs(5), collect(next.events))
            .await
            .unwrap();
        assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_deadline_frees_worker_when_consumer_stops_reading() {
        let backend = ScriptedBackend::new(Script {
            tokens: tokens(500),
            ..Default::default()
        });
        let scheduler = timed_scheduler(serving_engine(&backend).await, 1);

        let Submission {
            handle,
            events: _stalled,
        } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(3), handle.wait())
            .await
            .expect("deadline ignored while the sink was full");
        assert_eq!(status, SessionStatus::Cancelled);
        assert!(scheduler.engine().wait_idle(Duration::from_secs(4)).await);
    }

    #[tokio::test]
    async fn test_timeout_error_arrives_before_backend_returns() {
        let backend = ScriptedBackend::new(Script {
            tokens: vec!["too late".into()],
            whole: true,
            token_delay: Duration::from_secs(4),
            ..Default::default()
        });
        let scheduler = timed_scheduler(serving_engine(&backend).await, 1);

        let Submission { handle, mut events } = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        let started = Instant::now();
        assert_eq!(events.recv().await, Some(SessionEvent::Started));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timeout error held back until the backend returned");
        match event {
            Some(SessionEvent::Error { message }) => {
                assert_eq!(message, "generation timed out after 1s")
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.status(), SessionStatus::Cancelled);

        // Nothing follows the error.
        assert!(collect(events).await.is_empty());
    }

    #[tokio::test]
    async fn test_max_tokens_bounds_output() {
        let backend = ScriptedBackend::new(Script {
            tokens: tokens(50),
            ..Default::default()
        });
        let scheduler = scheduler(&backend).await;
        let params = GenerationConfig {
            max_tokens: 7,
            ..Default::default()
        };

        let outcome = scheduler
            .generate_collect("p".into(), params, true)
            .await
            .unwrap();
        assert_eq!(outcome.tokens_emitted, 7);
        assert_eq!(outcome.full_text, tokens(7).concat());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_batch_reports_failure() {
        let backend = ScriptedBackend::new(Script {
            tokens: tokens(3),
            fail_after: Some(1),
            ..Default::default()
        });
        let scheduler = scheduler(&backend).await;
        let outcome = scheduler
            .generate_collect("p".into(), GenerationConfig::default(), false)
            .await
            .unwrap();
        assert_eq!(outcome.full_text, "t0 ");
        assert_eq!(outcome.tokens_emitted, 1);
        assert!(outcome.error.unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_try_submit_reports_busy() {
        let backend = slow(20, 10);
        let scheduler = scheduler(&backend).await;

        let running = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        assert!(matches!(
            scheduler.try_submit("p".into(), GenerationConfig::default()),
            Err(SchedulerError::Busy)
        ));
        collect(running.events).await;
        running.handle.wait().await;

        // Retired sessions free the non-queuing path again.
        tokio::time::timeout(Duration::from_secs(1), async {
            while scheduler.pending() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(scheduler
            .try_submit("p".into(), GenerationConfig::default())
            .is_ok());
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let backend = slow(20, 10);
        let engine = serving_engine(&backend).await;
        let scheduler = SessionScheduler::start(
            engine,
            SchedulerConfig {
                max_queued: 1,
                ..Default::default()
            },
        );

        let _running = scheduler.submit("a".into(), GenerationConfig::default()).unwrap();
        let _waiting = scheduler.submit("b".into(), GenerationConfig::default()).unwrap();
        assert!(matches!(
            scheduler.submit("c".into(), GenerationConfig::default()),
            Err(SchedulerError::QueueFull(1))
        ));
    }

    #[tokio::test]
    async fn test_submit_refused_until_engine_ready() {
        let engine = Arc::new(EngineResource::new(None, Arc::new(PresentArtifact)));
        let scheduler = SessionScheduler::start(Arc::clone(&engine), SchedulerConfig::default());
        assert!(matches!(
            scheduler.submit("p".into(), GenerationConfig::default()),
            Err(SchedulerError::NotReady(EngineState::Uninitialized))
        ));

        engine
            .initialize(ModelConfig::default(), vec![crate::engine::DeviceCandidate::cpu(1)])
            .await
            .unwrap();
        let outcome = scheduler
            .generate_collect("hello".into(), GenerationConfig::default(), false)
            .await
            .unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.full_text.contains("simulation mode"));
    }

    #[tokio::test]
    async fn test_reload_waits_for_running_session() {
        let backend = slow(5, 10);
        let scheduler = scheduler(&backend).await;

        let running = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        let state = scheduler.reload(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, EngineState::Ready);
        assert_eq!(running.handle.wait().await, SessionStatus::Completed);
        assert_eq!(backend.recorder.compiled().len(), 2);
    }

    #[tokio::test]
    async fn test_reload_refused_after_drain_timeout() {
        let backend = slow(100, 20);
        let scheduler = scheduler(&backend).await;

        let running = scheduler
            .submit("p".into(), GenerationConfig::default())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while scheduler.engine().active_session().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            scheduler.reload(Duration::from_millis(50)).await,
            Err(EngineError::ReloadRefused(_))
        ));
        running.handle.cancel();
    }
}
