//! Handle kinds: the per-type descriptor every native handle carries.
//!
//! Typed views (bytes, ints, floats, ...) differ only in element size, so a
//! kind is a name plus that size. Struct-like kinds generated by the bindings
//! are declared opaque and resolve their size through [`crate::layout`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKind {
    name: &'static str,
    element_size: usize,
}

impl HandleKind {
    /// Untyped memory, addressed in bytes.
    pub const POINTER: Self = Self::new("pointer", 1);
    pub const BYTE: Self = Self::new("byte", 1);
    pub const BOOL: Self = Self::new("bool", 1);
    pub const SHORT: Self = Self::new("short", 2);
    pub const CHAR: Self = Self::new("char", 2);
    pub const INT: Self = Self::new("int", 4);
    pub const FLOAT: Self = Self::new("float", 4);
    pub const LONG: Self = Self::new("long", 8);
    pub const DOUBLE: Self = Self::new("double", 8);
    pub const SIZE: Self = Self::new("size_t", std::mem::size_of::<usize>());

    pub const fn new(name: &'static str, element_size: usize) -> Self {
        Self { name, element_size }
    }

    /// A struct-like kind whose size is only known from layout metadata.
    pub const fn opaque(name: &'static str) -> Self {
        Self {
            name,
            element_size: 0,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Fixed element size, or 0 for opaque kinds.
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    pub const fn is_opaque(&self) -> bool {
        self.element_size == 0
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sizes() {
        assert_eq!(HandleKind::POINTER.element_size(), 1);
        assert_eq!(HandleKind::INT.element_size(), 4);
        assert_eq!(HandleKind::DOUBLE.element_size(), 8);
        assert_eq!(
            HandleKind::SIZE.element_size(),
            std::mem::size_of::<usize>()
        );
        assert!(!HandleKind::FLOAT.is_opaque());
    }

    #[test]
    fn test_opaque_kind() {
        let k = HandleKind::opaque("timeval");
        assert!(k.is_opaque());
        assert_eq!(k.to_string(), "timeval");
        assert_ne!(k, HandleKind::opaque("timespec"));
    }
}
