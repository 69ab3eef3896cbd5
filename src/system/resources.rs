//! Memory, disk and CPU readings

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;

const GIB: u64 = 1024 * 1024 * 1024;

/// Below this much available memory a warning is logged
const LOW_MEMORY_BYTES: u64 = 4 * GIB;

/// Below this much free disk in the models directory a warning is logged
const LOW_DISK_BYTES: u64 = 2 * GIB;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskInfo {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Point-in-time host readings; fields are `None` where the platform gives no answer
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub cpu_cores: usize,
    pub memory: Option<MemoryInfo>,
    pub disk: Option<DiskInfo>,
    /// Resident memory of this process
    pub process_rss_bytes: Option<u64>,
}

impl SystemSnapshot {
    /// Take a reading, checking free disk at `models_dir`.
    pub async fn capture(models_dir: &Path) -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let memory = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|content| parse_meminfo(&content));

        let process_rss_bytes = tokio::fs::read_to_string("/proc/self/status")
            .await
            .ok()
            .and_then(|content| kib_field(&content, "VmRSS:"));

        Self {
            cpu_cores,
            memory,
            disk: disk_info(models_dir).await,
            process_rss_bytes,
        }
    }
}

/// Warnings for a host that is likely too small to serve the model
pub fn startup_warnings(snapshot: &SystemSnapshot) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(memory) = &snapshot.memory {
        if memory.available_bytes < LOW_MEMORY_BYTES {
            warnings.push(format!(
                "low memory: {:.1} GiB available, at least 4 GiB recommended",
                memory.available_bytes as f64 / GIB as f64
            ));
        }
    }
    if let Some(disk) = &snapshot.disk {
        if disk.available_bytes < LOW_DISK_BYTES {
            warnings.push(format!(
                "low disk space at {}: {:.1} GiB free, at least 2 GiB recommended",
                disk.path.display(),
                disk.available_bytes as f64 / GIB as f64
            ));
        }
    }
    warnings
}

fn kib_field(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let total_bytes = kib_field(content, "MemTotal:")?;
    let available_bytes = kib_field(content, "MemAvailable:")
        .or_else(|| kib_field(content, "MemFree:"))?;
    Some(MemoryInfo {
        total_bytes,
        available_bytes,
    })
}

/// Free space for the filesystem holding `path`, via POSIX `df`.
async fn disk_info(path: &Path) -> Option<DiskInfo> {
    // The models directory may not exist yet; measure the nearest existing ancestor.
    let existing = path.ancestors().find(|p| p.exists())?;
    let output = Command::new("df")
        .arg("-Pk")
        .arg(existing)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df(&String::from_utf8_lossy(&output.stdout), path)
}

fn parse_df(stdout: &str, path: &Path) -> Option<DiskInfo> {
    let fields: Vec<&str> = stdout.lines().nth(1)?.split_whitespace().collect();
    let total_kb: u64 = fields.get(1)?.parse().ok()?;
    let available_kb: u64 = fields.get(3)?.parse().ok()?;
    Some(DiskInfo {
        path: path.to_path_buf(),
        total_bytes: total_kb * 1024,
        available_bytes: available_kb * 1024,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16303428 kB\n\
MemFree:         1022412 kB\n\
MemAvailable:    9174820 kB\n\
Buffers:          402716 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.total_bytes, 16303428 * 1024);
        assert_eq!(info.available_bytes, 9174820 * 1024);
        assert!(info.used_percent() > 40.0 && info.used_percent() < 50.0);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let info = parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n").unwrap();
        assert_eq!(info.available_bytes, 40 * 1024);
        assert!(parse_meminfo("garbage").is_none());
    }

    #[test]
    fn test_parse_df() {
        let stdout = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n\
/dev/nvme0n1p2   491134656 301234567 164892345      65% /\n";
        let disk = parse_df(stdout, Path::new("./models")).unwrap();
        assert_eq!(disk.total_bytes, 491134656 * 1024);
        assert_eq!(disk.available_bytes, 164892345 * 1024);
        assert!(parse_df("header only\n", Path::new("/")).is_none());
    }

    #[test]
    fn test_startup_warnings_thresholds() {
        let mut snapshot = SystemSnapshot {
            cpu_cores: 4,
            memory: Some(MemoryInfo {
                total_bytes: 8 * GIB,
                available_bytes: GIB,
            }),
            disk: Some(DiskInfo {
                path: PathBuf::from("/models"),
                total_bytes: 100 * GIB,
                available_bytes: GIB,
            }),
            process_rss_bytes: None,
        };
        assert_eq!(startup_warnings(&snapshot).len(), 2);

        snapshot.memory = Some(MemoryInfo {
            total_bytes: 32 * GIB,
            available_bytes: 16 * GIB,
        });
        snapshot.disk = None;
        assert!(startup_warnings(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_capture_never_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = SystemSnapshot::capture(&tmp.path().join("not-yet")).await;
        assert!(snapshot.cpu_cores >= 1);
    }
}
