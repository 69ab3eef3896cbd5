//! Pull model artifacts from HuggingFace Hub

use std::path::Path;

use anyhow::Result;

use super::load_config;
use crate::loader::{ArtifactResolver, HubResolver};

/// Download the configured model, or `repo` when given, into the models directory.
pub async fn pull(config_path: &Path, repo: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut model = config.model;
    if let Some(repo) = repo {
        model.name = repo.rsplit('/').next().unwrap_or(&repo).to_string();
        model.repo_id = repo;
        // The configured tokenizer belongs to the configured model.
        model.tokenizer_repo = None;
    }

    let resolver = HubResolver::with_cache_dir(config.hardware.cache_dir);
    if let Some(path) = resolver.resolve_local(&model) {
        println!("{} is already present at {}", model.repo_id, path.display());
        return Ok(());
    }

    let dest = model.local_dir();
    println!("Downloading {} to {}", model.repo_id, dest.display());
    println!("Required files: {}", model.required_files.join(", "));
    if let Some(extra) = &model.tokenizer_repo {
        println!("Missing files taken from: {extra}");
    }

    // hf-hub's sync API blocks on network I/O.
    let path = tokio::task::spawn_blocking(move || resolver.fetch(&model, &dest)).await??;

    println!("\nModel downloaded to: {}", path.display());
    Ok(())
}
