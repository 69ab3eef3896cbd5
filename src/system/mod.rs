//! Host telemetry
//!
//! Read-only; informs warnings and status reports, never gates serving.

mod resources;

pub use resources::{startup_warnings, DiskInfo, MemoryInfo, SystemSnapshot};
