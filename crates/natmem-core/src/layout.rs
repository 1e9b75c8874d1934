//! Member offsets and sizes of native types.
//!
//! Generated bindings register `offsetof()`/`sizeof()` values here once, when
//! their native library is loaded. Lookups for a kind that never registered
//! fail with `TypeMetadataUnavailable`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Member name under which a kind's total size is stored.
pub const SIZEOF_MEMBER: &str = "sizeof";

static GLOBAL: Lazy<TypeLayouts> = Lazy::new(TypeLayouts::new);

#[derive(Debug, Default)]
pub struct TypeLayouts {
    tables: RwLock<HashMap<String, HashMap<String, usize>>>,
}

impl TypeLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide table consulted by native handles.
    pub fn global() -> &'static TypeLayouts {
        &GLOBAL
    }

    /// Record the byte offset of `member` within `kind`.
    pub fn register(&self, kind: &str, member: &str, offset: usize) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(kind.to_string())
            .or_default()
            .insert(member.to_string(), offset);
    }

    pub fn register_sizeof(&self, kind: &str, size: usize) {
        self.register(kind, SIZEOF_MEMBER, size);
    }

    pub fn offsetof(&self, kind: &str, member: &str) -> Result<usize> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(kind)
            .and_then(|members| members.get(member))
            .copied()
            .ok_or_else(|| Error::TypeMetadataUnavailable {
                kind: kind.to_string(),
                member: member.to_string(),
            })
    }

    pub fn sizeof(&self, kind: &str) -> Result<usize> {
        self.offsetof(kind, SIZEOF_MEMBER)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let layouts = TypeLayouts::new();
        layouts.register_sizeof("timeval", 16);
        layouts.register("timeval", "tv_usec", 8);

        assert!(layouts.contains("timeval"));
        assert_eq!(layouts.sizeof("timeval").unwrap(), 16);
        assert_eq!(layouts.offsetof("timeval", "tv_usec").unwrap(), 8);
    }

    #[test]
    fn test_unknown_kind_and_member() {
        let layouts = TypeLayouts::new();
        layouts.register_sizeof("stat", 144);

        let err = layouts.offsetof("dirent", "d_name").unwrap_err();
        assert!(matches!(err, Error::TypeMetadataUnavailable { ref kind, .. } if kind == "dirent"));

        let err = layouts.offsetof("stat", "st_mode").unwrap_err();
        assert!(
            matches!(err, Error::TypeMetadataUnavailable { ref member, .. } if member == "st_mode")
        );
    }
}
