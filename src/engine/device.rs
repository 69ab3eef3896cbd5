//! Compute devices and their compile profiles
//!
//! A device id names a compute target (`npu`, `gpu:1`, `cpu`). Each device
//! class carries a closed, validated profile instead of a free-form key/value
//! map, so an invalid combination is rejected when the plan is built rather
//! than when the backend first touches it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Class of compute target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Neural processing unit (constrained accelerator, static shapes)
    Npu,
    /// Discrete or integrated GPU
    Gpu,
    /// Host processor
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Npu => "npu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// A concrete device: kind plus ordinal (for multi-accelerator hosts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl DeviceId {
    pub const CPU: DeviceId = DeviceId {
        kind: DeviceKind::Cpu,
        ordinal: 0,
    };

    pub fn new(kind: DeviceKind, ordinal: usize) -> Self {
        Self { kind, ordinal }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ordinal == 0 {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}:{}", self.kind, self.ordinal)
        }
    }
}

impl FromStr for DeviceId {
    type Err = ConfigError;

    /// Accepts `npu`, `gpu`, `cpu`, optionally suffixed with `:<ordinal>`.
    /// Matching is case-insensitive; `cuda` and `metal` are accepted as GPU aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (name, ordinal) = match lowered.split_once(':') {
            Some((name, id)) => {
                let ordinal = id
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("bad device ordinal in '{s}'")))?;
                (name.to_string(), ordinal)
            }
            None => (lowered.clone(), 0),
        };

        let kind = match name.as_str() {
            "npu" => DeviceKind::Npu,
            "gpu" | "cuda" | "metal" => DeviceKind::Gpu,
            "cpu" => DeviceKind::Cpu,
            _ => return Err(ConfigError::Invalid(format!("unknown device '{s}'"))),
        };

        if kind == DeviceKind::Cpu && ordinal != 0 {
            return Err(ConfigError::Invalid(format!(
                "cpu does not take an ordinal (got '{s}')"
            )));
        }

        Ok(DeviceId { kind, ordinal })
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Backend scheduling hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceHint {
    #[default]
    Latency,
    Throughput,
}

/// Compiled-model cache policy for accelerators that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    OptimizeSpeed,
    OptimizeSize,
}

/// Device-class specific compile configuration
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceProfile {
    Npu {
        /// Compile with static input shapes (required by most NPUs)
        static_shapes: bool,
        /// Prompt length the static graph is compiled for
        max_prompt_len: usize,
        cache_mode: CacheMode,
    },
    Gpu {
        hint: PerformanceHint,
    },
    Cpu {
        /// Inference thread count
        threads: usize,
        hint: PerformanceHint,
    },
}

impl DeviceProfile {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceProfile::Npu { .. } => DeviceKind::Npu,
            DeviceProfile::Gpu { .. } => DeviceKind::Gpu,
            DeviceProfile::Cpu { .. } => DeviceKind::Cpu,
        }
    }

    /// Longest prompt, in tokens, a static-shape graph accepts
    pub fn prompt_limit(&self) -> Option<usize> {
        match self {
            DeviceProfile::Npu {
                static_shapes: true,
                max_prompt_len,
                ..
            } => Some(*max_prompt_len),
            _ => None,
        }
    }

    pub fn threads(&self) -> Option<usize> {
        match self {
            DeviceProfile::Cpu { threads, .. } => Some(*threads),
            _ => None,
        }
    }
}

/// One entry in the ordered device plan handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCandidate {
    pub id: DeviceId,
    pub profile: DeviceProfile,
}

impl DeviceCandidate {
    /// Build a candidate, rejecting a profile that does not match the device class.
    pub fn new(id: DeviceId, profile: DeviceProfile) -> Result<Self, ConfigError> {
        if profile.kind() != id.kind {
            return Err(ConfigError::Invalid(format!(
                "device {id} given a {} profile",
                profile.kind()
            )));
        }
        match profile {
            DeviceProfile::Npu { max_prompt_len, .. } if max_prompt_len == 0 => {
                return Err(ConfigError::Invalid(
                    "npu max_prompt_len must be positive".to_string(),
                ));
            }
            DeviceProfile::Cpu { threads, .. } if threads == 0 => {
                return Err(ConfigError::Invalid(
                    "cpu threads must be positive".to_string(),
                ));
            }
            _ => {}
        }
        Ok(Self { id, profile })
    }

    /// Plain CPU candidate with latency hint
    pub fn cpu(threads: usize) -> Self {
        Self {
            id: DeviceId::CPU,
            profile: DeviceProfile::Cpu {
                threads: threads.max(1),
                hint: PerformanceHint::Latency,
            },
        }
    }
}
