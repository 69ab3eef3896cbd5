//! One-shot generation command

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use super::{build_engine, load_config};
use crate::config::GenerationOverrides;
use crate::engine::{SessionEvent, SessionScheduler, Submission};

/// Generate one response through the same scheduler the server uses.
pub async fn generate(
    config_path: &Path,
    prompt: String,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    raw: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let overrides = GenerationOverrides {
        max_tokens,
        temperature,
        ..Default::default()
    };
    let params = config
        .generation
        .with_overrides(&overrides, config.model.max_context_length)?;

    let engine = build_engine(&config);
    let state = engine
        .initialize(config.model.clone(), config.hardware.device_plan()?)
        .await?;
    let status = engine.status();
    eprintln!(
        "Model:  {}\nDevice: {}\nState:  {state}{}\n",
        status.model.as_deref().unwrap_or("-"),
        status
            .device
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string()),
        if status.simulation { " (simulation)" } else { "" },
    );

    let scheduler = SessionScheduler::start(Arc::clone(&engine), config.scheduler.clone());
    let prompt = if raw {
        prompt
    } else {
        config.model.chat_template.render(&prompt)
    };
    let Submission { handle, mut events } = scheduler.submit(prompt, params)?;

    let mut stdout = std::io::stdout();
    let mut failure = None;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                eprintln!("\ncancelled");
                break;
            }
        };
        match event {
            Some(SessionEvent::Started) => {}
            Some(SessionEvent::Token(token)) => {
                write!(stdout, "{token}")?;
                stdout.flush()?;
            }
            Some(SessionEvent::Completed { tokens, elapsed }) => {
                writeln!(stdout)?;
                let secs = elapsed.as_secs_f64();
                let rate = if secs > 0.0 { tokens as f64 / secs } else { 0.0 };
                eprintln!("\n--- {tokens} tokens in {secs:.2}s ({rate:.1} tok/s) ---");
                break;
            }
            Some(SessionEvent::Error { message }) => {
                writeln!(stdout)?;
                failure = Some(message);
                break;
            }
            None => break,
        }
    }

    handle.wait().await;
    scheduler.shutdown();
    engine.shutdown();

    if let Some(message) = failure {
        bail!("generation failed: {message}");
    }
    Ok(())
}
