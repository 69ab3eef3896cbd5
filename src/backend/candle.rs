//! GGUF backend on candle's quantized llama
//!
//! Loads `*.gguf` weights and `tokenizer.json` from the artifact directory.
//! CPU always works; GPU needs a `cuda` or `metal` build; NPUs are not
//! supported and fail with a capability error so the plan moves on.

use std::fs::File;
use std::path::Path;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;

use super::{Generation, InferenceBackend, Pipeline};
use crate::config::GenerationConfig;
use crate::engine::{DeviceCandidate, DeviceKind};
use crate::error::BackendError;
use crate::loader::{find_file, ModelArtifact};

/// End-of-sequence markers across the common chat model families
const EOS_TOKENS: &[&str] = &[
    "</s>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|endoftext|>",
];

/// Seed used when a request leaves sampling unseeded
const DEFAULT_SEED: u64 = 299_792_458;

/// Window of recent tokens the repetition penalty looks at
const REPEAT_LAST_N: usize = 64;

/// Read by candle and rayon when the CPU pool starts
const THREADS_ENV: &str = "RAYON_NUM_THREADS";

#[derive(Debug, Default)]
pub struct CandleBackend;

impl CandleBackend {
    pub fn new() -> Self {
        Self
    }

    fn device_for(candidate: &DeviceCandidate) -> Result<Device, BackendError> {
        let name = candidate.id.to_string();
        match candidate.id.kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Npu => Err(BackendError::Capability {
                device: name,
                reason: "no NPU runtime in this build".to_string(),
            }),
            DeviceKind::Gpu => gpu_device(candidate.id.ordinal).map_err(|reason| {
                BackendError::Capability {
                    device: name,
                    reason,
                }
            }),
        }
    }
}

#[cfg(feature = "cuda")]
fn gpu_device(ordinal: usize) -> Result<Device, String> {
    Device::new_cuda(ordinal).map_err(|e| e.to_string())
}

#[cfg(all(feature = "metal", not(feature = "cuda")))]
fn gpu_device(ordinal: usize) -> Result<Device, String> {
    Device::new_metal(ordinal).map_err(|e| e.to_string())
}

#[cfg(not(any(feature = "cuda", feature = "metal")))]
fn gpu_device(_ordinal: usize) -> Result<Device, String> {
    Err("built without GPU support".to_string())
}

/// Out-of-memory style failures are capacity problems, the rest are load failures.
fn load_error(device: &str, reason: String) -> BackendError {
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("out of memory") || lowered.contains("alloc") {
        BackendError::Capacity {
            device: device.to_string(),
            reason,
        }
    } else {
        BackendError::Load {
            device: device.to_string(),
            reason,
        }
    }
}

impl InferenceBackend for CandleBackend {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn compile(
        &self,
        artifact: &ModelArtifact,
        candidate: &DeviceCandidate,
    ) -> Result<Box<dyn Pipeline>, BackendError> {
        let device_name = candidate.id.to_string();
        let device = Self::device_for(candidate)?;
        if let Some(threads) = candidate.profile.threads() {
            apply_cpu_threads(threads);
        }

        let gguf_path = find_file(&artifact.path, "*.gguf").ok_or_else(|| BackendError::Load {
            device: device_name.clone(),
            reason: format!("no .gguf file in {}", artifact.path.display()),
        })?;
        let tokenizer_path = artifact.path.join("tokenizer.json");

        tracing::info!(path = %gguf_path.display(), device = %device_name, "loading GGUF weights");
        let weights = load_weights(&gguf_path, &device)
            .map_err(|reason| load_error(&device_name, reason))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| BackendError::Load {
            device: device_name.clone(),
            reason: format!("failed to load tokenizer: {e}"),
        })?;
        let eos: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        Ok(Box::new(CandlePipeline {
            weights,
            tokenizer,
            device,
            eos,
            max_context_len: artifact.max_context_len,
            prompt_limit: candidate.profile.prompt_limit(),
        }))
    }
}

/// Size candle's CPU worker pool unless the environment already does.
///
/// Only takes effect before the pool first starts.
fn apply_cpu_threads(threads: usize) {
    match std::env::var(THREADS_ENV) {
        Ok(existing) => {
            tracing::debug!(threads = %existing, "cpu thread count taken from environment")
        }
        Err(_) => {
            std::env::set_var(THREADS_ENV, threads.to_string());
            tracing::info!(threads, "cpu inference threads");
        }
    }
}

/// Prompt tokens kept: room for the answer in the context, capped by a static graph.
fn prompt_budget(max_context_len: usize, max_tokens: usize, prompt_limit: Option<usize>) -> usize {
    let budget = max_context_len.saturating_sub(max_tokens).max(1);
    match prompt_limit {
        Some(limit) => budget.min(limit.max(1)),
        None => budget,
    }
}

fn load_weights(path: &Path, device: &Device) -> Result<ModelWeights, String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let content =
        gguf_file::Content::read(&mut file).map_err(|e| format!("failed to read GGUF: {e}"))?;
    ModelWeights::from_gguf(content, &mut file, device)
        .map_err(|e| format!("failed to load model weights: {e}"))
}

struct CandlePipeline {
    weights: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos: Vec<u32>,
    max_context_len: usize,
    prompt_limit: Option<usize>,
}

fn sampling_for(params: &GenerationConfig) -> Sampling {
    if params.is_greedy() {
        return Sampling::ArgMax;
    }
    let temperature = f64::from(params.temperature);
    let p = f64::from(params.top_p);
    match params.top_k {
        Some(k) if p < 1.0 => Sampling::TopKThenTopP { k, p, temperature },
        Some(k) => Sampling::TopK { k, temperature },
        None if p < 1.0 => Sampling::TopP { p, temperature },
        None => Sampling::All { temperature },
    }
}

impl Pipeline for CandlePipeline {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationConfig,
    ) -> Result<Generation<'_>, BackendError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| BackendError::Generation(format!("tokenizer encode error: {e}")))?;
        let mut prompt_tokens = encoding.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            return Err(BackendError::Generation("prompt produced no tokens".to_string()));
        }

        // Keep the tail of an over-long prompt so the answer still fits.
        let budget = prompt_budget(self.max_context_len, params.max_tokens, self.prompt_limit);
        if prompt_tokens.len() > budget {
            tracing::warn!(
                prompt_tokens = prompt_tokens.len(),
                budget,
                "prompt exceeds context budget, truncating from the left"
            );
            prompt_tokens.drain(..prompt_tokens.len() - budget);
        }

        let sampler =
            LogitsProcessor::from_sampling(params.seed.unwrap_or(DEFAULT_SEED), sampling_for(params));

        Ok(Generation::Incremental(Box::new(CandleTokens {
            pipeline: self,
            sampler,
            repeat_penalty: params.repeat_penalty,
            remaining: params.max_tokens,
            pending_input: Some(prompt_tokens.clone()),
            position: 0,
            all_tokens: prompt_tokens,
            generated: Vec::new(),
            emitted_len: 0,
            done: false,
        })))
    }
}

/// Token-by-token decode loop over one prompt
struct CandleTokens<'a> {
    pipeline: &'a mut CandlePipeline,
    sampler: LogitsProcessor,
    repeat_penalty: f32,
    remaining: usize,
    /// Tokens to feed on the next forward pass (the prompt, then one token at a time)
    pending_input: Option<Vec<u32>>,
    position: usize,
    all_tokens: Vec<u32>,
    generated: Vec<u32>,
    /// Length of decoded text already emitted
    emitted_len: usize,
    done: bool,
}

impl CandleTokens<'_> {
    fn step(&mut self) -> Result<Option<u32>, BackendError> {
        let Some(input) = self.pending_input.take() else {
            return Ok(None);
        };
        let gen_err = |e: candle_core::Error| BackendError::Generation(e.to_string());

        let tensor = Tensor::new(input.as_slice(), &self.pipeline.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(gen_err)?;
        let logits = self
            .pipeline
            .weights
            .forward(&tensor, self.position)
            .and_then(|l| l.squeeze(0))
            .and_then(|l| l.to_dtype(candle_core::DType::F32))
            .map_err(gen_err)?;
        self.position += input.len();

        let logits = if (self.repeat_penalty - 1.0).abs() < f32::EPSILON {
            logits
        } else {
            let start = self.all_tokens.len().saturating_sub(REPEAT_LAST_N);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &self.all_tokens[start..],
            )
            .map_err(gen_err)?
        };

        let token = self.sampler.sample(&logits).map_err(gen_err)?;
        Ok(Some(token))
    }

    /// Decode everything generated so far and return the unseen suffix.
    fn new_text(&mut self) -> Result<Option<String>, BackendError> {
        let text = self
            .pipeline
            .tokenizer
            .decode(&self.generated, true)
            .map_err(|e| BackendError::Generation(format!("tokenizer decode error: {e}")))?;
        // A partial multi-byte sequence decodes to U+FFFD; wait for more tokens.
        if text.len() <= self.emitted_len || text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        let Some(fresh) = text.get(self.emitted_len..) else {
            return Ok(None);
        };
        let fresh = fresh.to_string();
        self.emitted_len = text.len();
        Ok(Some(fresh))
    }
}

impl Iterator for CandleTokens<'_> {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.remaining == 0 || self.position >= self.pipeline.max_context_len {
                self.done = true;
                break;
            }
            let token = match self.step() {
                Ok(Some(token)) => token,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            self.remaining -= 1;
            if self.pipeline.eos.contains(&token) {
                self.done = true;
                break;
            }
            self.all_tokens.push(token);
            self.generated.push(token);
            self.pending_input = Some(vec![token]);

            match self.new_text() {
                Ok(Some(text)) => return Some(Ok(text)),
                Ok(None) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DeviceId;

    #[test]
    fn test_sampling_selection() {
        assert!(matches!(
            sampling_for(&GenerationConfig::greedy()),
            Sampling::ArgMax
        ));
        assert!(matches!(
            sampling_for(&GenerationConfig::default()),
            Sampling::TopKThenTopP { k: 50, .. }
        ));
        let params = GenerationConfig {
            top_k: None,
            top_p: 1.0,
            ..Default::default()
        };
        assert!(matches!(sampling_for(&params), Sampling::All { .. }));
    }

    #[test]
    fn test_npu_is_a_capability_failure() {
        let npu = DeviceCandidate::new(
            DeviceId::new(DeviceKind::Npu, 0),
            crate::engine::DeviceProfile::Npu {
                static_shapes: true,
                max_prompt_len: 1024,
                cache_mode: Default::default(),
            },
        )
        .unwrap();
        let err = CandleBackend::device_for(&npu).unwrap_err();
        assert!(err.is_device_specific());
    }

    #[test]
    fn test_missing_weights_is_a_load_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ModelArtifact {
            name: "empty".into(),
            path: tmp.path().to_path_buf(),
            max_context_len: 2048,
        };
        let err = CandleBackend::new()
            .compile(&artifact, &DeviceCandidate::cpu(1))
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::Load { .. }));
    }

    #[test]
    fn test_prompt_budget_respects_static_limit() {
        assert_eq!(prompt_budget(4096, 500, None), 3596);
        assert_eq!(prompt_budget(4096, 500, Some(1024)), 1024);
        assert_eq!(prompt_budget(600, 500, Some(1024)), 100);
        assert_eq!(prompt_budget(100, 500, None), 1);
    }

    #[test]
    fn test_load_error_classification() {
        assert!(load_error("gpu", "CUDA out of memory".into()).is_device_specific());
        assert!(!load_error("cpu", "bad magic".into()).is_device_specific());
    }
}
