//! Generation configuration settings

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Configuration for text generation
///
/// The process-wide defaults come from the config file; each request may
/// override individual fields through [`GenerationOverrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for sampling (0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-p nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k sampling (None = disabled)
    #[serde(default = "default_top_k")]
    pub top_k: Option<usize>,

    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repeat_penalty", alias = "repetition_penalty")]
    pub repeat_penalty: f32,

    /// Random seed (None = random)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> usize {
    500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> Option<usize> {
    Some(50)
}

fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding config (temperature = 0)
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: None,
            ..Default::default()
        }
    }

    /// Check if greedy decoding should be used
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Apply per-request overrides on top of these defaults and validate the result.
    pub fn with_overrides(
        &self,
        overrides: &GenerationOverrides,
        max_context_len: usize,
    ) -> Result<Self, ValidationError> {
        let merged = Self {
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            top_k: overrides.top_k.or(self.top_k),
            repeat_penalty: overrides.repetition_penalty.unwrap_or(self.repeat_penalty),
            seed: self.seed,
        };
        merged.validate(max_context_len)?;
        Ok(merged)
    }

    /// Reject parameters outside the ranges the backends accept.
    pub fn validate(&self, max_context_len: usize) -> Result<(), ValidationError> {
        fn out_of_range(field: &'static str, detail: String) -> ValidationError {
            ValidationError::OutOfRange { field, detail }
        }

        if self.max_tokens == 0 || self.max_tokens > max_context_len {
            return Err(out_of_range(
                "max_tokens",
                format!("{} not in 1..={max_context_len}", self.max_tokens),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(out_of_range(
                "temperature",
                format!("{} not in 0..=2", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(out_of_range("top_p", format!("{} not in (0, 1]", self.top_p)));
        }
        if self.top_k == Some(0) {
            return Err(out_of_range("top_k", "must be at least 1".to_string()));
        }
        if !(self.repeat_penalty > 0.0 && self.repeat_penalty <= 10.0) {
            return Err(out_of_range(
                "repetition_penalty",
                format!("{} not in (0, 10]", self.repeat_penalty),
            ));
        }
        Ok(())
    }
}

/// Optional per-request generation settings
///
/// Accepts both snake_case and camelCase keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "topP")]
    pub top_p: Option<f32>,
    #[serde(default, alias = "topK")]
    pub top_k: Option<usize>,
    #[serde(default, alias = "repetitionPenalty")]
    pub repetition_penalty: Option<f32>,
}
