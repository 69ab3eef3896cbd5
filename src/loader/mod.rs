//! Model artifact resolution
//!
//! The engine only needs a local directory holding the model files. This
//! module finds one, or asks a resolver to fetch it. Download failures are
//! always reported; they never turn into a fake success.

mod hub;

pub use hub::HubResolver;

use std::path::{Path, PathBuf};

use crate::config::ModelConfig;
use crate::error::DownloadError;

/// A model ready to be compiled by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    /// Display name
    pub name: String,
    /// Directory containing the model files
    pub path: PathBuf,
    /// Context length the pipeline must support
    pub max_context_len: usize,
}

/// Locates or downloads model artifacts
pub trait ArtifactResolver: Send + Sync {
    /// Return a local directory that satisfies `model.required_files`, if one exists.
    fn resolve_local(&self, model: &ModelConfig) -> Option<PathBuf>;

    /// Download the artifacts for `model` into `dest`, returning the directory used.
    fn fetch(&self, model: &ModelConfig, dest: &Path) -> Result<PathBuf, DownloadError>;
}

/// Find the model locally, fetching it when missing.
pub fn resolve(
    resolver: &dyn ArtifactResolver,
    model: &ModelConfig,
) -> Result<ModelArtifact, DownloadError> {
    let path = match resolver.resolve_local(model) {
        Some(path) => {
            tracing::info!(path = %path.display(), "model found locally");
            path
        }
        None => {
            let dest = model.local_dir();
            tracing::info!(repo = %model.repo_id, dest = %dest.display(), "model not found locally, downloading");
            resolver.fetch(model, &dest)?
        }
    };

    Ok(ModelArtifact {
        name: model.name.clone(),
        path,
        max_context_len: model.max_context_length,
    })
}

/// Patterns from `required` that match nothing in `dir`
pub fn missing_files(dir: &Path, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|pattern| !pattern_exists(dir, pattern))
        .cloned()
        .collect()
}

/// True when `dir` exists, is non-empty, and satisfies every required pattern
pub fn is_complete(dir: &Path, required: &[String]) -> bool {
    let non_empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    non_empty && missing_files(dir, required).is_empty()
}

/// First file in `dir` matching `pattern`
pub fn find_file(dir: &Path, pattern: &str) -> Option<PathBuf> {
    let full = dir.join(pattern);
    glob::glob(full.to_str()?)
        .ok()?
        .filter_map(|r| r.ok())
        .find(|p| p.is_file())
}

fn pattern_exists(dir: &Path, pattern: &str) -> bool {
    find_file(dir, pattern).is_some()
}
