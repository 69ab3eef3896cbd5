//! Scripted backend for tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Generation, InferenceBackend, Pipeline};
use crate::config::{GenerationConfig, ModelConfig};
use crate::engine::{DeviceCandidate, DeviceId, DeviceKind, EngineResource};
use crate::error::{BackendError, DownloadError};
use crate::loader::{ArtifactResolver, ModelArtifact};

/// Resolver that reports every model as already present
pub(crate) struct PresentArtifact;

impl ArtifactResolver for PresentArtifact {
    fn resolve_local(&self, model: &ModelConfig) -> Option<PathBuf> {
        Some(model.local_dir())
    }

    fn fetch(&self, model: &ModelConfig, _dest: &Path) -> Result<PathBuf, DownloadError> {
        Err(DownloadError::NotFound(model.repo_id.clone()))
    }
}

/// Engine bound to `backend` on the CPU, ready to serve
pub(crate) async fn serving_engine(backend: &ScriptedBackend) -> Arc<EngineResource> {
    let engine = EngineResource::new(Some(Arc::new(backend.clone())), Arc::new(PresentArtifact));
    engine
        .initialize(ModelConfig::default(), vec![DeviceCandidate::cpu(1)])
        .await
        .expect("scripted engine initializes");
    Arc::new(engine)
}

#[derive(Default)]
pub(crate) struct Script {
    pub tokens: Vec<String>,
    pub fail_after: Option<usize>,
    pub token_delay: Duration,
    pub whole: bool,
    pub compile_failures: HashMap<DeviceKind, BackendError>,
}

#[derive(Default)]
pub(crate) struct Recorder {
    pub compiles: Mutex<Vec<DeviceCandidate>>,
    pub generations: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Recorder {
    pub fn compiled(&self) -> Vec<DeviceId> {
        self.candidates().iter().map(|c| c.id).collect()
    }

    /// Every candidate handed to `compile`, profile included
    pub fn candidates(&self) -> Vec<DeviceCandidate> {
        self.compiles.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    script: Arc<Script>,
    pub recorder: Arc<Recorder>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn with_tokens(tokens: &[&str]) -> Self {
        Self::new(Script {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        })
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn compile(
        &self,
        _artifact: &ModelArtifact,
        device: &DeviceCandidate,
    ) -> Result<Box<dyn Pipeline>, BackendError> {
        if let Ok(mut compiles) = self.recorder.compiles.lock() {
            compiles.push(device.clone());
        }
        if let Some(err) = self.script.compile_failures.get(&device.id.kind) {
            return Err(err.clone());
        }
        Ok(Box::new(ScriptedPipeline {
            script: Arc::clone(&self.script),
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct ScriptedPipeline {
    script: Arc<Script>,
    recorder: Arc<Recorder>,
}

struct InFlight(Arc<Recorder>);

impl InFlight {
    fn enter(recorder: &Arc<Recorder>) -> Self {
        let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(recorder))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Pipeline for ScriptedPipeline {
    fn generate(
        &mut self,
        _prompt: &str,
        _params: &GenerationConfig,
    ) -> Result<Generation<'_>, BackendError> {
        self.recorder.generations.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::enter(&self.recorder);
        let script = Arc::clone(&self.script);

        if script.whole {
            std::thread::sleep(script.token_delay);
            drop(guard);
            return Ok(Generation::Whole(script.tokens.concat()));
        }

        let iter = (0..).map_while(move |i| {
            let _held = &guard;
            if script.fail_after == Some(i) {
                return Some(Err(BackendError::Generation("scripted failure".into())));
            }
            let token = script.tokens.get(i)?.clone();
            std::thread::sleep(script.token_delay);
            Some(Ok(token))
        });
        // Stop after the first error.
        let mut failed = false;
        let iter = iter.take_while(move |item| {
            if failed {
                return false;
            }
            failed = item.is_err();
            true
        });
        Ok(Generation::Incremental(Box::new(iter)))
    }
}
