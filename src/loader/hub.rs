//! HuggingFace Hub artifact resolver

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};

use super::{is_complete, missing_files, ArtifactResolver};
use crate::config::ModelConfig;
use crate::error::DownloadError;

/// Resolves models from the local models directory, downloading from the Hub when absent
#[derive(Debug, Default, Clone)]
pub struct HubResolver {
    /// Hub download cache; hf-hub's default location when unset
    cache_dir: Option<PathBuf>,
}

impl HubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }
}

/// Files in `available` matching any pattern, and the patterns nothing matched
fn select_files(available: &[String], patterns: &[String]) -> (Vec<String>, Vec<String>) {
    let compiled: Vec<(&String, glob::Pattern)> = patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok().map(|g| (p, g)))
        .collect();

    let files = available
        .iter()
        .filter(|name| compiled.iter().any(|(_, g)| g.matches(name)))
        .cloned()
        .collect();
    let unmatched = compiled
        .iter()
        .filter(|(_, g)| !available.iter().any(|name| g.matches(name)))
        .map(|(p, _)| (*p).clone())
        .collect();
    (files, unmatched)
}

fn storage(path: &Path) -> impl FnOnce(std::io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

/// Download `names` from `repo` and copy them into `dest`.
fn download(repo: &ApiRepo, repo_id: &str, names: &[String], dest: &Path) -> Result<(), DownloadError> {
    for name in names {
        tracing::info!(repo = %repo_id, file = %name, "downloading");
        let cached = repo.get(name).map_err(|e| DownloadError::Network {
            repo: repo_id.to_string(),
            reason: e.to_string(),
        })?;

        let target = dest.join(name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(storage(parent))?;
        }
        std::fs::copy(&cached, &target).map_err(storage(&target))?;
    }
    Ok(())
}

impl ArtifactResolver for HubResolver {
    fn resolve_local(&self, model: &ModelConfig) -> Option<PathBuf> {
        // A repo id that is itself a local directory wins.
        let direct = PathBuf::from(&model.repo_id);
        if direct.is_dir() && is_complete(&direct, &model.required_files) {
            return Some(direct);
        }

        let in_dir = model.local_dir();
        if is_complete(&in_dir, &model.required_files) {
            return Some(in_dir);
        }

        if in_dir.exists() {
            tracing::warn!(
                path = %in_dir.display(),
                missing = ?missing_files(&in_dir, &model.required_files),
                "model directory exists but is missing required files"
            );
        }
        None
    }

    fn fetch(&self, model: &ModelConfig, dest: &Path) -> Result<PathBuf, DownloadError> {
        let repo_id = model.repo_id.clone();
        let network = |repo: &str, reason: String| DownloadError::Network {
            repo: repo.to_string(),
            reason,
        };

        std::fs::create_dir_all(dest).map_err(storage(dest))?;

        let mut builder = ApiBuilder::new();
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().map_err(|e| network(&repo_id, e.to_string()))?;

        let listing = |id: &str| -> Result<(ApiRepo, Vec<String>), DownloadError> {
            let repo = api.model(id.to_string());
            let info = repo.info().map_err(|e| network(id, e.to_string()))?;
            let names = info.siblings.into_iter().map(|s| s.rfilename).collect();
            Ok((repo, names))
        };

        let (repo, names) = listing(&repo_id)?;
        if names.is_empty() {
            return Err(DownloadError::NotFound(repo_id));
        }
        let (files, unmatched) = select_files(&names, &model.required_files);
        download(&repo, &repo_id, &files, dest)?;

        match &model.tokenizer_repo {
            Some(extra_id) if !unmatched.is_empty() && *extra_id != repo_id => {
                tracing::info!(repo = %extra_id, files = ?unmatched, "fetching files the model repo lacks");
                let (extra, names) = listing(extra_id)?;
                let (files, _) = select_files(&names, &unmatched);
                download(&extra, extra_id, &files, dest)?;
            }
            _ => {}
        }

        let missing = missing_files(dest, &model.required_files);
        if !missing.is_empty() {
            return Err(DownloadError::Incomplete {
                repo: repo_id,
                missing: missing.join(", "),
            });
        }

        tracing::info!(repo = %repo_id, path = %dest.display(), "model downloaded");
        Ok(dest.to_path_buf())
    }
}
