//! Convenient re-exports for downstream crates.

pub use crate::budget::{Ceiling, HostCollector, MemoryProbe, NoopCollector};
pub use crate::config::{CollectorMode, RuntimeConfig};
pub use crate::error::{Error, Result};
pub use crate::id::{EntryId, ScopeId};
pub use crate::kind::HandleKind;
pub use crate::layout::TypeLayouts;
