//! natmem-mem: native handle ownership, release bridging, scopes, and the
//! memory budget governor.
//!
//! Every native region a handle owns is registered with a [`Runtime`] and
//! released exactly once: explicitly, when its reference count drops to
//! zero, when an enclosing [`HandleScope`] closes, or when the last handle
//! referring to it goes away. Registration goes through the budget governor,
//! which enforces the configured tracked-byte and physical-memory ceilings.
//!
//! Raw memory only enters through [`native::NativeAllocator`] and the
//! `unsafe` adopt constructors; everything above them is safe code.

mod bridge;
pub mod error;
mod governor;
pub mod handle;
pub mod native;
pub mod probe;
pub mod refcount;
mod registry;
pub mod releaser;
pub mod runtime;
pub mod scope;
pub mod tracking;

pub use error::{Error, Result};
pub use handle::NativeHandle;
pub use native::{NativeAllocator, SystemAllocator};
pub use probe::ProcessMemoryProbe;
pub use releaser::{CustomReleaser, DirectReleaser, ProxyReleaser, Releaser};
pub use runtime::{ReleaseRoutine, Runtime, RuntimeBuilder, RuntimeStats};
pub use scope::HandleScope;
