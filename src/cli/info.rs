//! Backend, device plan and host information

use std::path::Path;

use anyhow::Result;

use super::load_config;
use crate::backend;
use crate::engine::DeviceProfile;
use crate::loader::{missing_files, ArtifactResolver, HubResolver};
use crate::system::{startup_warnings, SystemSnapshot};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Print what `serve` would run with, without loading the model.
pub async fn info(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Backend:");
    match backend::detect() {
        Some(b) => println!("  {}", b.name()),
        None => println!("  none compiled in (simulation mode)"),
    }

    println!("\nModel:");
    println!("  Name: {}", config.model.name);
    println!("  Repository: {}", config.model.repo_id);
    if let Some(extra) = &config.model.tokenizer_repo {
        println!("  Tokenizer fallback: {extra}");
    }
    println!("  Max context: {}", config.model.max_context_length);
    println!("  Chat template: {:?}", config.model.chat_template);
    let resolver = HubResolver::with_cache_dir(config.hardware.cache_dir.clone());
    match resolver.resolve_local(&config.model) {
        Some(path) => println!("  Local artifacts: {}", path.display()),
        None => {
            let dir = config.model.local_dir();
            println!("  Local artifacts: not found at {}", dir.display());
            let missing = missing_files(&dir, &config.model.required_files);
            if !missing.is_empty() {
                println!("  Missing: {}", missing.join(", "));
            }
        }
    }

    println!("\nDevice plan:");
    for (i, candidate) in config.hardware.device_plan()?.iter().enumerate() {
        let detail = match &candidate.profile {
            DeviceProfile::Npu {
                static_shapes,
                max_prompt_len,
                cache_mode,
            } => format!(
                "static_shapes={static_shapes}, max_prompt_len={max_prompt_len}, cache={cache_mode:?}"
            ),
            DeviceProfile::Gpu { hint } => format!("hint={hint:?}"),
            DeviceProfile::Cpu { threads, hint } => format!("threads={threads}, hint={hint:?}"),
        };
        println!("  {}. {} ({detail})", i + 1, candidate.id);
    }

    let snapshot = SystemSnapshot::capture(&config.model.models_dir).await;
    println!("\nHost:");
    println!("  CPU cores: {}", snapshot.cpu_cores);
    if let Some(memory) = &snapshot.memory {
        println!(
            "  Memory: {:.1} GiB available of {:.1} GiB ({:.0}% used)",
            memory.available_bytes as f64 / GIB,
            memory.total_bytes as f64 / GIB,
            memory.used_percent()
        );
    }
    if let Some(disk) = &snapshot.disk {
        println!(
            "  Disk at {}: {:.1} GiB free",
            disk.path.display(),
            disk.available_bytes as f64 / GIB
        );
    }
    for warning in startup_warnings(&snapshot) {
        println!("  Warning: {warning}");
    }

    Ok(())
}
