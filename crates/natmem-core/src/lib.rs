#![forbid(unsafe_code)]
//! natmem-core: shared vocabulary for the native-memory ownership runtime.
//!
//! Nothing in here touches native memory. Ids, handle kinds, the type-layout
//! table filled in by generated bindings, runtime configuration, and the
//! abstract budget hooks live here so bindings can depend on them without
//! pulling in the runtime itself.

pub mod budget;
pub mod config;
pub mod error;
pub mod id;
pub mod kind;
pub mod layout;
pub mod prelude;

pub use error::{Error, Result};
