//! HTTP server command

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use super::{build_engine, load_config};
use crate::engine::SessionScheduler;
use crate::server::{self, AppState};
use crate::system::{startup_warnings, SystemSnapshot};

/// Start the inference server
pub async fn serve(config_path: &Path, port: Option<u16>, host: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let snapshot = SystemSnapshot::capture(&config.model.models_dir).await;
    tracing::info!(
        cpu_cores = snapshot.cpu_cores,
        memory_used_percent = snapshot.memory.as_ref().map(|m| m.used_percent()),
        "system check"
    );
    for warning in startup_warnings(&snapshot) {
        tracing::warn!("{warning}");
    }

    let devices = config.hardware.device_plan()?;
    let engine = build_engine(&config);
    let scheduler = SessionScheduler::start(Arc::clone(&engine), config.scheduler.clone());

    // Load in the background; health reports 503 until the engine settles.
    let model = config.model.clone();
    let init_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        tracing::info!(model = %model.name, "initializing engine");
        match init_engine.initialize(model, devices).await {
            Ok(state) => tracing::info!(%state, "engine initialized"),
            Err(err) => tracing::error!(error = %err, "engine initialization failed, inference disabled"),
        }
    });

    let state = Arc::new(AppState::new(Arc::clone(&scheduler), config));
    server::start(state, shutdown_signal()).await?;

    tracing::info!("shutting down");
    scheduler.shutdown();
    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("ctrl-c received");
}
