//! Inference backend interface
//!
//! The numerical model is opaque to the rest of the crate. A backend compiles
//! a model artifact for one device into a [`Pipeline`]; a pipeline produces
//! text for a prompt, either as a whole response or token by token. The
//! engine normalizes both shapes into one token sequence.
//!
//! Pipelines are blocking and non-reentrant. Only the engine calls into them,
//! from a blocking thread, one generation at a time.

#[cfg(feature = "candle")]
mod candle;
#[cfg(test)]
pub(crate) mod scripted;
mod simulation;

#[cfg(feature = "candle")]
pub use self::candle::CandleBackend;
pub use simulation::SimulationPipeline;

use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::engine::DeviceCandidate;
use crate::error::BackendError;
use crate::loader::ModelArtifact;

/// Token sequence produced incrementally by a backend
pub type TokenIter<'a> = Box<dyn Iterator<Item = Result<String, BackendError>> + Send + 'a>;

/// Output of one backend call
pub enum Generation<'a> {
    /// Complete response text, produced in one blocking call
    Whole(String),
    /// Lazily produced tokens
    Incremental(TokenIter<'a>),
}

/// A model compiled and bound to one device
pub trait Pipeline: Send {
    /// Start generating for `prompt`. Called at most once per session.
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationConfig,
    ) -> Result<Generation<'_>, BackendError>;
}

/// Compiles model artifacts into pipelines
pub trait InferenceBackend: Send + Sync {
    /// Backend name for status reporting
    fn name(&self) -> &'static str;

    /// Compile or load `artifact` for `device`.
    fn compile(
        &self,
        artifact: &ModelArtifact,
        device: &DeviceCandidate,
    ) -> Result<Box<dyn Pipeline>, BackendError>;
}

/// Return the backend compiled into this build, if any.
///
/// `None` means no inference runtime is available and the engine will bind
/// the simulation pipeline instead.
pub fn detect() -> Option<Arc<dyn InferenceBackend>> {
    #[cfg(feature = "candle")]
    {
        Some(Arc::new(CandleBackend::new()))
    }
    #[cfg(not(feature = "candle"))]
    {
        None
    }
}

/// Split a whole response into word chunks, each keeping its trailing whitespace.
///
/// Concatenating the chunks reproduces `text` exactly.
pub fn split_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_space = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            in_space = true;
        } else if in_space {
            chunks.push(std::mem::take(&mut current));
            in_space = false;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
