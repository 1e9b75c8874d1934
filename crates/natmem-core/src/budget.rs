//! Abstract memory budget interfaces.
//!
//! The governor that enforces ceilings lives in `natmem-mem`. Only the hooks
//! it consumes from the host are defined here, so embedders can provide their
//! own without depending on the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Measures memory actually resident in the process.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident bytes right now. Called on every admission while a physical
    /// ceiling is configured, so keep it reasonably cheap.
    fn physical_bytes(&self) -> usize;
}

/// Host-side collection hook.
///
/// The governor calls this before each retry so an embedding host with its
/// own collector can drop unreachable handles.
pub trait HostCollector: Send + Sync + 'static {
    fn collect(&self);
}

/// Collector for hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl HostCollector for NoopCollector {
    fn collect(&self) {}
}

/// Which ceiling rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    TrackedBytes,
    PhysicalBytes,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ceiling::TrackedBytes => f.write_str("tracked-bytes"),
            Ceiling::PhysicalBytes => f.write_str("physical-bytes"),
        }
    }
}
