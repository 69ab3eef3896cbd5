//! The shared inference engine
//!
//! `EngineResource` owns the one compiled pipeline and is the only type that
//! calls into a backend. At most one session holds it at a time; the holder
//! is released on every exit path, including a panicking backend.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::cancel::CancelToken;
use super::fallback::DeviceFallbackResolver;
use super::{DeviceCandidate, DeviceId, SessionId};
use crate::backend::{split_words, Generation, InferenceBackend, Pipeline, SimulationPipeline, TokenIter};
use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{BackendError, EngineError};
use crate::loader::{self, ArtifactResolver};

/// Tokens buffered between the backend thread and the serving worker
const TOKEN_BUFFER: usize = 32;

/// Externally visible engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Loading,
    /// Serving on the preferred device
    Ready,
    /// Serving on a fallback device, or in simulation mode
    Degraded,
    Failed,
}

impl EngineState {
    /// True when generation requests can be admitted
    pub fn is_serving(self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Degraded)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Degraded => "degraded",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the current pipeline was bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    Preferred,
    Fallback,
    /// No inference runtime; canned output
    Simulation,
}

type SharedPipeline = Arc<Mutex<Box<dyn Pipeline>>>;

/// The pipeline handle exists only in `Bound`.
enum Binding {
    Uninitialized,
    Loading,
    Bound {
        device: Option<DeviceId>,
        mode: BindingMode,
        pipeline: SharedPipeline,
    },
    Failed {
        reason: String,
    },
}

impl Binding {
    fn state(&self) -> EngineState {
        match self {
            Binding::Uninitialized => EngineState::Uninitialized,
            Binding::Loading => EngineState::Loading,
            Binding::Bound {
                mode: BindingMode::Preferred,
                ..
            } => EngineState::Ready,
            Binding::Bound { .. } => EngineState::Degraded,
            Binding::Failed { .. } => EngineState::Failed,
        }
    }
}

/// What initialization was asked to load; reused verbatim by reload
#[derive(Debug, Clone)]
struct LoadPlan {
    model: ModelConfig,
    devices: Vec<DeviceCandidate>,
}

struct EngineInner {
    binding: Binding,
    plan: Option<LoadPlan>,
}

/// Point-in-time engine status
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub backend: &'static str,
    /// Bound device; `None` in simulation mode or when nothing is bound
    pub device: Option<DeviceId>,
    pub mode: Option<BindingMode>,
    pub simulation: bool,
    pub active_session: Option<SessionId>,
    pub model: Option<String>,
    pub failure: Option<String>,
}

impl EngineStatus {
    pub fn model_loaded(&self) -> bool {
        self.state.is_serving()
    }
}

/// Owner of the single compiled model pipeline
pub struct EngineResource {
    backend: Option<Arc<dyn InferenceBackend>>,
    resolver: Arc<dyn ArtifactResolver>,
    inner: Mutex<EngineInner>,
    state: watch::Sender<EngineState>,
    active: Arc<watch::Sender<Option<SessionId>>>,
}

impl EngineResource {
    /// Create an uninitialized engine.
    ///
    /// A `None` backend means no inference runtime is available; initialization
    /// then binds the simulation pipeline.
    pub fn new(
        backend: Option<Arc<dyn InferenceBackend>>,
        resolver: Arc<dyn ArtifactResolver>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Uninitialized);
        let (active, _) = watch::channel(None);
        Self {
            backend,
            resolver,
            inner: Mutex::new(EngineInner {
                binding: Binding::Uninitialized,
                plan: None,
            }),
            state,
            active: Arc::new(active),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        *self.active.borrow()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("simulation", |b| b.name())
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.lock();
        let (device, mode, failure) = match &inner.binding {
            Binding::Bound { device, mode, .. } => (*device, Some(*mode), None),
            Binding::Failed { reason } => (None, None, Some(reason.clone())),
            _ => (None, None, None),
        };
        EngineStatus {
            state: inner.binding.state(),
            backend: self.backend_name(),
            device,
            mode,
            simulation: mode == Some(BindingMode::Simulation),
            active_session: self.active_session(),
            model: inner.plan.as_ref().map(|p| p.model.name.clone()),
            failure,
        }
    }

    /// Resolve the model artifact and bind it to the first device that accepts it.
    pub async fn initialize(
        &self,
        model: ModelConfig,
        devices: Vec<DeviceCandidate>,
    ) -> Result<EngineState, EngineError> {
        let plan = LoadPlan { model, devices };
        {
            let mut inner = self.lock();
            self.begin_loading(&mut inner)?;
            inner.plan = Some(plan.clone());
        }
        self.load(plan).await
    }

    /// Tear down the current pipeline and rerun initialization with the same plan.
    ///
    /// Refused while a session holds the engine.
    pub async fn reload(&self) -> Result<EngineState, EngineError> {
        let plan = {
            let mut inner = self.lock();
            let plan = inner.plan.clone().ok_or_else(|| {
                EngineError::ReloadRefused("engine was never initialized".to_string())
            })?;
            self.begin_loading(&mut inner)?;
            plan
        };
        tracing::info!(model = %plan.model.name, "reloading model");
        self.load(plan).await
    }

    /// Move to `Loading`, dropping any bound pipeline. Caller holds the lock.
    fn begin_loading(&self, inner: &mut EngineInner) -> Result<(), EngineError> {
        if let Some(active) = self.active_session() {
            return Err(EngineError::ReloadRefused(format!("{active} is running")));
        }
        if matches!(inner.binding, Binding::Loading) {
            return Err(EngineError::ReloadRefused(
                "initialization already in progress".to_string(),
            ));
        }
        inner.binding = Binding::Loading;
        self.state.send_replace(EngineState::Loading);
        Ok(())
    }

    async fn load(&self, plan: LoadPlan) -> Result<EngineState, EngineError> {
        let backend = self.backend.clone();
        let resolver = Arc::clone(&self.resolver);

        let outcome = tokio::task::spawn_blocking(move || bind(backend, resolver.as_ref(), &plan))
            .await
            .unwrap_or_else(|e| Err(EngineError::Initialization(format!("loader panicked: {e}"))));

        let mut inner = self.lock();
        let result = match outcome {
            Ok(binding) => {
                inner.binding = binding;
                Ok(inner.binding.state())
            }
            Err(err) => {
                tracing::error!(error = %err, "engine initialization failed");
                inner.binding = Binding::Failed {
                    reason: err.to_string(),
                };
                Err(err)
            }
        };
        self.state.send_replace(inner.binding.state());
        result
    }

    /// Wait until the engine is not loading, returning the settled state.
    pub async fn settled(&self) -> EngineState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| *s != EngineState::Loading).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Wait up to `timeout` for the active session to release the engine.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        let idle = tokio::time::timeout(timeout, rx.wait_for(|a| a.is_none()))
            .await
            .is_ok();
        idle
    }

    /// Run one generation on the bound pipeline.
    ///
    /// Fails with `NotReady` unless a pipeline is bound, and with `Busy` if
    /// another session holds the engine. The backend is called exactly once,
    /// on a blocking thread; the engine is released when that call finishes.
    pub fn invoke(
        &self,
        session: SessionId,
        prompt: String,
        params: GenerationConfig,
        cancel: CancelToken,
    ) -> Result<TokenStream, EngineError> {
        let pipeline = {
            let inner = self.lock();
            let pipeline = match &inner.binding {
                Binding::Bound { pipeline, .. } => Arc::clone(pipeline),
                other => return Err(EngineError::NotReady { state: other.state() }),
            };
            let mut holder = None;
            self.active.send_if_modified(|active| match active {
                Some(current) => {
                    holder = Some(*current);
                    false
                }
                None => {
                    *active = Some(session);
                    true
                }
            });
            if let Some(active) = holder {
                return Err(EngineError::Busy { active });
            }
            pipeline
        };

        let release = ActiveGuard {
            active: Arc::clone(&self.active),
            session,
        };
        let (tx, rx) = mpsc::channel(TOKEN_BUFFER);

        let join = tokio::task::spawn_blocking(move || {
            let _release = release;
            let mut pipeline = pipeline.lock().unwrap_or_else(PoisonError::into_inner);

            let tokens: TokenIter<'_> = match pipeline.generate(&prompt, &params) {
                Ok(Generation::Incremental(iter)) => iter,
                Ok(Generation::Whole(text)) => Box::new(split_words(&text).into_iter().map(Ok)),
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };

            for item in tokens {
                if cancel.is_cancelled() {
                    tracing::debug!(session = %session, "backend loop observed cancellation");
                    break;
                }
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
        });

        Ok(TokenStream { rx, join })
    }

    /// Release the pipeline. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(active) = self.active_session() {
            tracing::warn!(session = %active, "shutting down with a session still running");
        }
        if matches!(inner.binding, Binding::Bound { .. }) {
            tracing::info!("releasing model pipeline");
        }
        inner.binding = Binding::Uninitialized;
        self.state.send_replace(EngineState::Uninitialized);
    }
}

/// Build a binding for `plan`. Runs on a blocking thread.
fn bind(
    backend: Option<Arc<dyn InferenceBackend>>,
    resolver: &dyn ArtifactResolver,
    plan: &LoadPlan,
) -> Result<Binding, EngineError> {
    let Some(backend) = backend else {
        tracing::warn!("no inference backend available, running in simulation mode");
        return Ok(Binding::Bound {
            device: None,
            mode: BindingMode::Simulation,
            pipeline: Arc::new(Mutex::new(Box::new(SimulationPipeline::new()))),
        });
    };

    let artifact = loader::resolve(resolver, &plan.model)?;
    let resolved = DeviceFallbackResolver::new(plan.devices.clone())
        .resolve(|candidate| backend.compile(&artifact, candidate))
        .map_err(|exhausted| EngineError::Initialization(exhausted.summary()))?;

    let mode = if resolved.preferred {
        BindingMode::Preferred
    } else {
        BindingMode::Fallback
    };
    tracing::info!(
        model = %artifact.name,
        device = %resolved.device,
        backend = backend.name(),
        ?mode,
        "model ready"
    );
    Ok(Binding::Bound {
        device: Some(resolved.device),
        mode,
        pipeline: Arc::new(Mutex::new(resolved.value)),
    })
}

/// Clears the active session when the backend call ends, however it ends
struct ActiveGuard {
    active: Arc<watch::Sender<Option<SessionId>>>,
    session: SessionId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.send_if_modified(|active| {
            if *active == Some(self.session) {
                *active = None;
                true
            } else {
                false
            }
        });
    }
}

/// Lazily produced tokens for one invocation
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String, BackendError>>,
    join: JoinHandle<()>,
}

impl TokenStream {
    /// Stop consuming and wait for the backend call to return.
    ///
    /// Once this resolves the engine has been released.
    pub async fn finish(self) -> Result<(), BackendError> {
        drop(self.rx);
        self.join
            .await
            .map_err(|e| BackendError::Generation(format!("backend task failed: {e}")))
    }
}

impl Stream for TokenStream {
    type Item = Result<String, BackendError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{PresentArtifact, Script, ScriptedBackend};
    use crate::engine::{DeviceKind, DeviceProfile};
    use futures::StreamExt;
    use std::collections::HashMap;

    fn npu_then_cpu() -> Vec<DeviceCandidate> {
        let npu = DeviceCandidate::new(
            DeviceId::new(DeviceKind::Npu, 0),
            DeviceProfile::Npu {
                static_shapes: true,
                max_prompt_len: 512,
                cache_mode: Default::default(),
            },
        )
        .unwrap();
        vec![npu, DeviceCandidate::cpu(2)]
    }

    fn engine_with(backend: &ScriptedBackend) -> EngineResource {
        EngineResource::new(
            Some(Arc::new(backend.clone())),
            Arc::new(PresentArtifact),
        )
    }

    fn npu_unavailable() -> HashMap<DeviceKind, BackendError> {
        HashMap::from([(
            DeviceKind::Npu,
            BackendError::Capability {
                device: "npu".into(),
                reason: "no npu driver".into(),
            },
        )])
    }

    async fn drain(mut stream: TokenStream) -> Vec<Result<String, BackendError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        stream.finish().await.unwrap();
        items
    }

    #[tokio::test]
    async fn test_initialize_on_preferred_device_is_ready() {
        let backend = ScriptedBackend::with_tokens(&["a"]);
        let engine = engine_with(&backend);
        let state = engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();
        assert_eq!(state, EngineState::Ready);
        let status = engine.status();
        assert_eq!(status.device, Some(DeviceId::new(DeviceKind::Npu, 0)));
        assert!(!status.simulation);
    }

    #[tokio::test]
    async fn test_fallback_binds_second_device_as_degraded() {
        let backend = ScriptedBackend::new(Script {
            compile_failures: npu_unavailable(),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        let state = engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        assert_eq!(state, EngineState::Degraded);
        assert_eq!(engine.status().device, Some(DeviceId::CPU));
        assert_eq!(engine.status().mode, Some(BindingMode::Fallback));
        // The failed device is attempted exactly once in the pass.
        assert_eq!(
            backend.recorder.compiled(),
            vec![DeviceId::new(DeviceKind::Npu, 0), DeviceId::CPU]
        );
    }

    #[tokio::test]
    async fn test_configured_profiles_reach_the_backend() {
        let backend = ScriptedBackend::new(Script {
            compile_failures: npu_unavailable(),
            ..Default::default()
        });
        let hardware: crate::config::HardwareConfig =
            serde_yaml::from_str("devices: [npu, cpu]\nnpu:\n  max_prompt_len: 256\ncpu:\n  threads: 8\n")
                .unwrap();
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), hardware.device_plan().unwrap())
            .await
            .unwrap();

        let candidates = backend.recorder.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].profile.prompt_limit(), Some(256));
        assert_eq!(candidates[1].profile.threads(), Some(8));
    }

    #[tokio::test]
    async fn test_exhausted_fallback_fails() {
        let mut failures = npu_unavailable();
        failures.insert(
            DeviceKind::Cpu,
            BackendError::Load {
                device: "cpu".into(),
                reason: "corrupt weights".into(),
            },
        );
        let backend = ScriptedBackend::new(Script {
            compile_failures: failures,
            ..Default::default()
        });
        let engine = engine_with(&backend);
        let err = engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Initialization(_)));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(engine.status().failure.unwrap().contains("corrupt weights"));
        let invoked = engine.invoke(
            SessionId::next(),
            "hi".into(),
            GenerationConfig::default(),
            CancelToken::new(),
        );
        assert!(matches!(
            invoked,
            Err(EngineError::NotReady {
                state: EngineState::Failed
            })
        ));
    }

    #[tokio::test]
    async fn test_simulation_mode_is_reported() {
        let engine = EngineResource::new(None, Arc::new(PresentArtifact));
        let state = engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();
        assert_eq!(state, EngineState::Degraded);
        let status = engine.status();
        assert!(status.simulation);
        assert_eq!(status.device, None);
        assert_eq!(status.backend, "simulation");
    }

    #[tokio::test]
    async fn test_invoke_is_exclusive_and_released() {
        let backend = ScriptedBackend::new(Script {
            tokens: vec!["a".into(), "b".into(), "c".into()],
            token_delay: Duration::from_millis(20),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let first = SessionId::next();
        let stream = engine
            .invoke(first, "p".into(), GenerationConfig::default(), CancelToken::new())
            .unwrap();
        assert_eq!(engine.active_session(), Some(first));

        let second = engine.invoke(
            SessionId::next(),
            "p".into(),
            GenerationConfig::default(),
            CancelToken::new(),
        );
        assert!(matches!(second, Err(EngineError::Busy { active }) if active == first));

        let tokens: Vec<String> = drain(stream).await.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
        assert_eq!(engine.active_session(), None);
        assert_eq!(backend.recorder.generations(), 1);
    }

    #[tokio::test]
    async fn test_whole_response_is_split_into_tokens() {
        let backend = ScriptedBackend::new(Script {
            tokens: vec!["Hello ".into(), "there ".into(), "friend".into()],
            whole: true,
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let stream = engine
            .invoke(SessionId::next(), "p".into(), GenerationConfig::default(), CancelToken::new())
            .unwrap();
        let tokens: Vec<String> = drain(stream).await.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["Hello ", "there ", "friend"]);
    }

    #[tokio::test]
    async fn test_backend_error_ends_stream_and_releases() {
        let backend = ScriptedBackend::new(Script {
            tokens: vec!["a".into(), "b".into(), "c".into()],
            fail_after: Some(1),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let stream = engine
            .invoke(SessionId::next(), "p".into(), GenerationConfig::default(), CancelToken::new())
            .unwrap();
        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert_eq!(engine.active_session(), None);
    }

    #[tokio::test]
    async fn test_cancel_stops_backend_loop() {
        let backend = ScriptedBackend::new(Script {
            tokens: (0..100).map(|i| format!("t{i} ")).collect(),
            token_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let cancel = CancelToken::new();
        let mut stream = engine
            .invoke(SessionId::next(), "p".into(), GenerationConfig::default(), cancel.clone())
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        cancel.cancel();
        stream.finish().await.unwrap();
        assert_eq!(engine.active_session(), None);
    }

    #[tokio::test]
    async fn test_reload_is_idempotent() {
        let backend = ScriptedBackend::new(Script {
            compile_failures: npu_unavailable(),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let once = engine.reload().await.unwrap();
        let once_device = engine.status().device;
        let twice = engine.reload().await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(once_device, engine.status().device);
        assert_eq!(twice, EngineState::Degraded);
        // Each pass re-resolves the full device order.
        assert_eq!(backend.recorder.compiled().len(), 6);
    }

    #[tokio::test]
    async fn test_reload_refused_while_running() {
        let backend = ScriptedBackend::new(Script {
            tokens: vec!["a".into(), "b".into()],
            token_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let engine = engine_with(&backend);
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();

        let stream = engine
            .invoke(SessionId::next(), "p".into(), GenerationConfig::default(), CancelToken::new())
            .unwrap();
        assert!(matches!(
            engine.reload().await,
            Err(EngineError::ReloadRefused(_))
        ));
        assert_eq!(engine.state(), EngineState::Ready);

        drain(stream).await;
        assert!(engine.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(engine.reload().await.unwrap(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_reload_before_initialize_is_refused() {
        let engine = EngineResource::new(None, Arc::new(PresentArtifact));
        assert!(matches!(
            engine.reload().await,
            Err(EngineError::ReloadRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_pipeline() {
        let engine = EngineResource::new(None, Arc::new(PresentArtifact));
        engine
            .initialize(ModelConfig::default(), npu_then_cpu())
            .await
            .unwrap();
        engine.shutdown();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine
            .invoke(SessionId::next(), "p".into(), GenerationConfig::default(), CancelToken::new())
            .is_err());
    }
}
