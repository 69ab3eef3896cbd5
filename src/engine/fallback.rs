//! Device fallback resolution
//!
//! One ordered pass over the device plan. The first device that compiles
//! wins; every device is attempted at most once per pass.

use crate::engine::{DeviceCandidate, DeviceId};
use crate::error::BackendError;

/// Successful pass: the bound device and what compiling it produced
#[derive(Debug)]
pub struct Resolved<T> {
    pub device: DeviceId,
    pub value: T,
    /// False when an earlier, preferred device failed
    pub preferred: bool,
    /// Devices that failed before this one, in attempt order
    pub failures: Vec<(DeviceId, BackendError)>,
}

/// Every device in the plan failed
#[derive(Debug)]
pub struct Exhausted {
    pub failures: Vec<(DeviceId, BackendError)>,
}

impl Exhausted {
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|(device, err)| format!("{device}: {err}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Decides which device to attempt next and when to demote
#[derive(Debug, Clone)]
pub struct DeviceFallbackResolver {
    plan: Vec<DeviceCandidate>,
}

impl DeviceFallbackResolver {
    pub fn new(plan: Vec<DeviceCandidate>) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &[DeviceCandidate] {
        &self.plan
    }

    /// Try `attempt` on each candidate in order until one succeeds.
    pub fn resolve<T, F>(&self, mut attempt: F) -> Result<Resolved<T>, Exhausted>
    where
        F: FnMut(&DeviceCandidate) -> Result<T, BackendError>,
    {
        let mut failures = Vec::new();

        for (index, candidate) in self.plan.iter().enumerate() {
            tracing::info!(device = %candidate.id, "compiling model");
            match attempt(candidate) {
                Ok(value) => {
                    if index > 0 {
                        tracing::warn!(
                            device = %candidate.id,
                            skipped = index,
                            "running on fallback device"
                        );
                    }
                    return Ok(Resolved {
                        device: candidate.id,
                        value,
                        preferred: index == 0,
                        failures,
                    });
                }
                Err(err) => {
                    if err.is_device_specific() {
                        tracing::warn!(device = %candidate.id, error = %err, "device unavailable, trying next");
                    } else {
                        tracing::error!(device = %candidate.id, error = %err, "model failed to load");
                    }
                    failures.push((candidate.id, err));
                }
            }
        }

        tracing::error!(attempted = failures.len(), "device fallback exhausted");
        Err(Exhausted { failures })
    }
}
