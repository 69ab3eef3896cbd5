//! Simulation pipeline used when no inference runtime is available
//!
//! Produces a fixed, deterministic token sequence so the serving path can be
//! exercised end to end. The engine always reports this mode explicitly.

use super::{split_words, Generation, Pipeline};
use crate::config::GenerationConfig;
use crate::error::BackendError;

const CANNED_REPLY: &str = "This server is running in simulation mode because no inference \
backend is available in this build. Rebuild with the `candle` feature to serve a real model. ";

/// Deterministic stand-in for a compiled model
#[derive(Debug, Default)]
pub struct SimulationPipeline;

impl SimulationPipeline {
    pub fn new() -> Self {
        Self
    }

    /// The full reply for a prompt, before the `max_tokens` cut
    pub fn reply_for(prompt: &str) -> String {
        format!(
            "{CANNED_REPLY}Received a prompt of {} characters.",
            prompt.chars().count()
        )
    }
}

impl Pipeline for SimulationPipeline {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationConfig,
    ) -> Result<Generation<'_>, BackendError> {
        let tokens = split_words(&Self::reply_for(prompt));
        let iter = tokens.into_iter().take(params.max_tokens).map(Ok);
        Ok(Generation::Incremental(Box::new(iter)))
    }
}
