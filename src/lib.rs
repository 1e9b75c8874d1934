//! natmem: deterministic ownership of native memory.
//!
//! Facade over [`natmem_core`] (ids, kinds, layouts, configuration) and
//! [`natmem_mem`] (handles, scopes, the runtime and its budget governor).

pub use natmem_core;
pub use natmem_mem;

pub use natmem_core::config::{CollectorMode, RuntimeConfig};
pub use natmem_core::kind::HandleKind;
pub use natmem_core::layout::TypeLayouts;
pub use natmem_mem::{Error, HandleScope, NativeHandle, Result, Runtime, RuntimeStats};

pub mod prelude {
    pub use natmem_core::prelude::*;
    pub use natmem_mem::native::NativeAllocator;
    pub use natmem_mem::releaser::Releaser;
    pub use natmem_mem::{HandleScope, NativeHandle, Runtime, RuntimeBuilder, RuntimeStats};
}
