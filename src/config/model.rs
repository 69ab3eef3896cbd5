//! Model selection settings

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::prompt::ChatTemplate;

/// Which model to serve and where its artifacts live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Display name
    #[serde(default = "default_name")]
    pub name: String,

    /// HuggingFace repository id, or a path to a local artifact directory
    #[serde(default = "default_repo_id")]
    pub repo_id: String,

    /// Directory holding downloaded artifacts
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Repository to take files from that `repo_id` does not carry,
    /// typically `tokenizer.json` for GGUF-only repositories
    #[serde(default = "default_tokenizer_repo")]
    pub tokenizer_repo: Option<String>,

    /// Glob patterns that must each match at least one file in the artifact directory
    #[serde(default = "default_required_files")]
    pub required_files: Vec<String>,

    /// Maximum context length (prompt plus generated tokens)
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Prompt template applied to user messages
    #[serde(default)]
    pub chat_template: ChatTemplate,
}

fn default_name() -> String {
    "Llama-3.2-1B-Instruct".to_string()
}

fn default_repo_id() -> String {
    "bartowski/Llama-3.2-1B-Instruct-GGUF".to_string()
}

fn default_tokenizer_repo() -> Option<String> {
    Some("unsloth/Llama-3.2-1B-Instruct".to_string())
}

fn default_models_dir() -> PathBuf {
    std::env::var("HEARTH_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./models"))
}

fn default_required_files() -> Vec<String> {
    vec!["*Q4_K_M.gguf".to_string(), "tokenizer.json".to_string()]
}

fn default_max_context_length() -> usize {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            repo_id: default_repo_id(),
            tokenizer_repo: default_tokenizer_repo(),
            models_dir: default_models_dir(),
            required_files: default_required_files(),
            max_context_length: default_max_context_length(),
            chat_template: ChatTemplate::default(),
        }
    }
}

impl ModelConfig {
    /// Local directory the artifacts for this model are stored in
    pub fn local_dir(&self) -> PathBuf {
        self.models_dir.join(self.repo_id.replace('/', "_"))
    }
}
