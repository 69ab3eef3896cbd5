//! CLI commands

mod generate;
mod info;
mod pull;
mod serve;

pub use generate::generate;
pub use info::info;
pub use pull::pull;
pub use serve::serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::backend;
use crate::config::HearthConfig;
use crate::engine::EngineResource;
use crate::loader::HubResolver;

/// Hearth - local LLM server with one shared engine and token streaming
#[derive(Parser)]
#[command(name = "hearth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, short, global = true, default_value = "config.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and websocket server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,
    },

    /// Generate a single response, streaming tokens to stdout
    Generate {
        /// User message
        prompt: String,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// Send the prompt as-is instead of applying the chat template
        #[arg(long)]
        raw: bool,
    },

    /// Download the configured model artifacts
    Pull {
        /// Repository id to fetch instead of the configured one
        repo: Option<String>,
    },

    /// Show backend availability, device plan and host resources
    Info,
}

/// Load and validate configuration.
pub fn load_config(path: &Path) -> Result<HearthConfig> {
    HearthConfig::load(path).with_context(|| format!("loading configuration from {}", path.display()))
}

/// Log filter directive from the configuration file, read before logging starts.
///
/// An unreadable configuration falls back to the default; `load_config`
/// reports the problem once logging is up.
pub fn configured_log_directive(path: &Path) -> String {
    HearthConfig::load(path)
        .map(|config| config.server)
        .unwrap_or_default()
        .log_directive()
}

/// Engine wired to the compiled-in backend and the Hub resolver
pub(crate) fn build_engine(config: &HearthConfig) -> Arc<EngineResource> {
    let backend = backend::detect();
    match &backend {
        Some(b) => tracing::info!(backend = b.name(), "inference backend available"),
        None => tracing::warn!("no inference backend compiled in, serving in simulation mode"),
    }
    let resolver = HubResolver::with_cache_dir(config.hardware.cache_dir.clone());
    Arc::new(EngineResource::new(backend, Arc::new(resolver)))
}
