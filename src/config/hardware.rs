//! Hardware and device-order settings

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::{
    CacheMode, DeviceCandidate, DeviceId, DeviceKind, DeviceProfile, PerformanceHint,
};
use crate::error::ConfigError;

/// NPU compile settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpuSettings {
    #[serde(default = "default_true")]
    pub static_shapes: bool,

    #[serde(default = "default_max_prompt_len")]
    pub max_prompt_len: usize,

    #[serde(default)]
    pub cache_mode: CacheMode,
}

impl Default for NpuSettings {
    fn default() -> Self {
        Self {
            static_shapes: true,
            max_prompt_len: default_max_prompt_len(),
            cache_mode: CacheMode::default(),
        }
    }
}

/// GPU compile settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuSettings {
    #[serde(default)]
    pub hint: PerformanceHint,
}

/// CPU compile settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuSettings {
    /// Inference threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub hint: PerformanceHint,
}

impl Default for CpuSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            hint: PerformanceHint::default(),
        }
    }
}

/// Device selection and per-class compile settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Devices to try, most preferred first
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceId>,

    /// Single preferred device in older configurations. When set it replaces
    /// `devices` with itself followed by the CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,

    /// Download cache for Hub artifacts; the Hub's own default when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub npu: NpuSettings,

    #[serde(default)]
    pub gpu: GpuSettings,

    #[serde(default)]
    pub cpu: CpuSettings,
}

fn default_true() -> bool {
    true
}

fn default_max_prompt_len() -> usize {
    1024
}

fn default_threads() -> usize {
    4
}

fn default_devices() -> Vec<DeviceId> {
    vec![DeviceId::new(DeviceKind::Npu, 0), DeviceId::CPU]
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            device: None,
            cache_dir: None,
            npu: NpuSettings::default(),
            gpu: GpuSettings::default(),
            cpu: CpuSettings::default(),
        }
    }
}

impl HardwareConfig {
    /// Build the validated, ordered device plan for engine initialization.
    pub fn device_plan(&self) -> Result<Vec<DeviceCandidate>, ConfigError> {
        let order = self.device_order();
        if order.is_empty() {
            return Err(ConfigError::Invalid(
                "hardware.devices must list at least one device".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(order.len());
        for id in &order {
            if !seen.insert(*id) {
                return Err(ConfigError::Invalid(format!(
                    "device {id} listed more than once"
                )));
            }
            let profile = match id.kind {
                DeviceKind::Npu => DeviceProfile::Npu {
                    static_shapes: self.npu.static_shapes,
                    max_prompt_len: self.npu.max_prompt_len,
                    cache_mode: self.npu.cache_mode,
                },
                DeviceKind::Gpu => DeviceProfile::Gpu {
                    hint: self.gpu.hint,
                },
                DeviceKind::Cpu => DeviceProfile::Cpu {
                    threads: self.cpu.threads,
                    hint: self.cpu.hint,
                },
            };
            plan.push(DeviceCandidate::new(*id, profile)?);
        }
        Ok(plan)
    }

    fn device_order(&self) -> Vec<DeviceId> {
        match self.device {
            Some(DeviceId::CPU) => vec![DeviceId::CPU],
            Some(preferred) => vec![preferred, DeviceId::CPU],
            None => self.devices.clone(),
        }
    }
}
