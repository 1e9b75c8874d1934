//! Native handles: the in-process representative of a native memory region.
//!
//! A handle carries the address plus an element cursor (`position`), an
//! exclusive bound (`limit`, 0 = unknown), and the element count it was
//! created with (`capacity`). Ownership lives in the registry entry it holds:
//! the handle reads as null as soon as that entry has released, whichever
//! path released it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::Arc;

use natmem_core::kind::HandleKind;
use natmem_core::layout::TypeLayouts;

use crate::error::{Error, Result};
use crate::registry::Entry;

/// Element size of `kind`, consulting layout metadata for opaque kinds.
pub(crate) fn element_size(kind: HandleKind) -> Result<usize> {
    if kind.is_opaque() {
        Ok(TypeLayouts::global().sizeof(kind.name())?)
    } else {
        Ok(kind.element_size())
    }
}

#[derive(Debug)]
pub struct NativeHandle {
    kind: HandleKind,
    address: usize,
    position: usize,
    limit: usize,
    capacity: usize,
    /// Bytes known to be valid from `address`; bounds every memory access.
    extent: usize,
    entry: Option<Arc<Entry>>,
}

impl NativeHandle {
    /// A handle pointing nowhere.
    pub fn null(kind: HandleKind) -> Self {
        Self {
            kind,
            address: 0,
            position: 0,
            limit: 0,
            capacity: 0,
            extent: 0,
            entry: None,
        }
    }

    pub(crate) fn owned(
        kind: HandleKind,
        address: usize,
        capacity: usize,
        extent: usize,
        entry: Arc<Entry>,
    ) -> Self {
        Self {
            kind,
            address,
            position: 0,
            limit: capacity,
            capacity,
            extent,
            entry: Some(entry),
        }
    }

    /// Same fields, no ownership.
    pub(crate) fn unowned_copy(&self) -> Self {
        Self {
            kind: self.kind,
            address: self.address(),
            position: self.position,
            limit: self.limit,
            capacity: self.capacity,
            extent: if self.is_null() { 0 } else { self.extent },
            entry: None,
        }
    }

    pub(crate) fn set_entry(&mut self, entry: Arc<Entry>) {
        self.entry = Some(entry);
    }

    pub(crate) fn entry(&self) -> Option<&Arc<Entry>> {
        self.entry.as_ref()
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Native address, or 0 once the handle has been released.
    pub fn address(&self) -> usize {
        match &self.entry {
            Some(entry) if !entry.is_live() => 0,
            _ => self.address,
        }
    }

    pub fn is_null(&self) -> bool {
        self.address() == 0
    }

    /// Forget the address without releasing anything.
    pub fn set_null(&mut self) -> &mut Self {
        self.address = 0;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) -> &mut Self {
        self.position = position;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = limit;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets both capacity and limit.
    pub fn set_capacity(&mut self, capacity: usize) -> &mut Self {
        self.limit = capacity;
        self.capacity = capacity;
        self
    }

    /// Size of one element in bytes.
    pub fn sizeof(&self) -> Result<usize> {
        element_size(self.kind)
    }

    /// Byte offset of `member` within this handle's native type.
    pub fn offsetof(&self, member: &str) -> Result<usize> {
        Ok(TypeLayouts::global().offsetof(self.kind.name(), member)?)
    }

    /// Bytes this handle charges against the budget while registered.
    pub fn tracked_bytes(&self) -> usize {
        match &self.entry {
            Some(entry) if !entry.is_fired() => entry.bytes(),
            _ => 0,
        }
    }

    pub fn has_releaser(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| !e.is_fired())
    }

    /// Release the native resource now.
    pub fn deallocate(&mut self) {
        self.deallocate_with(true);
    }

    /// With `fire`, release now; without, unregister the releaser and leave
    /// the resource to whoever the caller handed it to.
    pub fn deallocate_with(&mut self, fire: bool) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        if fire {
            entry.fire();
            self.address = 0;
        } else if entry.detach() {
            self.extent = 0;
        }
    }

    /// Add an explicit reference. No-op without a releaser.
    pub fn retain_reference(&self) -> &Self {
        if let Some(entry) = &self.entry {
            entry.retain();
        }
        self
    }

    /// Drop an explicit reference; true if this call released the resource.
    pub fn release_reference(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| e.release())
    }

    /// Explicit reference count, or -1 without a live releaser.
    pub fn reference_count(&self) -> i32 {
        self.entry.as_ref().map_or(-1, |e| e.count())
    }

    /// Elements covered by an operation: one when `limit` is 0, else `limit - position`.
    fn element_range(&self) -> Result<usize> {
        if self.limit > 0 && self.limit < self.position {
            return Err(Error::InvalidRange {
                position: self.position,
                limit: self.limit,
            });
        }
        Ok(if self.limit == 0 {
            1
        } else {
            self.limit - self.position
        })
    }

    /// Start address and length of `len` bytes at the cursor, bounds-checked.
    fn span_at_position(&self, op: &'static str, len: usize) -> Result<(usize, usize)> {
        if self.is_null() {
            return Err(Error::NullResource(op));
        }
        let offset = self.position.saturating_mul(self.sizeof()?);
        let end = offset.saturating_add(len);
        if end > self.extent {
            return Err(Error::OutOfBounds {
                requested: end,
                extent: self.extent,
            });
        }
        Ok((self.address + offset, len))
    }

    fn with_span<R>(
        &self,
        op: &'static str,
        len: usize,
        f: impl FnOnce(*mut u8, usize) -> R,
    ) -> Result<R> {
        let entry = self.entry.as_ref().ok_or(Error::NullResource(op))?;
        let (start, len) = self.span_at_position(op, len)?;
        entry
            .with_live(|| f(start as *mut u8, len))
            .ok_or(Error::NullResource(op))
    }

    fn range_bytes(&self) -> Result<usize> {
        Ok(self.element_range()?.saturating_mul(self.sizeof()?))
    }

    /// Set every byte in `[position, limit)` to `byte`.
    pub fn fill(&mut self, byte: u8) -> Result<&mut Self> {
        let len = self.range_bytes()?;
        // SAFETY: span is inside the extent and the entry latch is held.
        self.with_span("fill", len, |p, n| unsafe { ptr::write_bytes(p, byte, n) })?;
        Ok(self)
    }

    pub fn zero(&mut self) -> Result<&mut Self> {
        self.fill(0)
    }

    /// Copy of the bytes in `[position, limit)`.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let len = self.range_bytes()?;
        // SAFETY: span is inside the extent and the entry latch is held.
        self.with_span("to_vec", len, |p, n| unsafe {
            std::slice::from_raw_parts(p as *const u8, n).to_vec()
        })
    }

    /// Write `data` starting at the cursor.
    pub fn copy_from_slice(&mut self, data: &[u8]) -> Result<&mut Self> {
        // SAFETY: span is inside the extent and the entry latch is held;
        // `data` is a Rust slice and cannot overlap memory behind the latch.
        self.with_span("copy_from_slice", data.len(), |p, n| unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), p, n)
        })?;
        Ok(self)
    }

    /// Copy `src`'s `[position, limit)` range to this handle's cursor.
    pub fn put(&mut self, src: &NativeHandle) -> Result<&mut Self> {
        let bytes = src.to_vec()?;
        self.copy_from_slice(&bytes)
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.address() == other.address()
            && self.position == other.position
    }
}

impl Hash for NativeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let releaser = match &self.entry {
            Some(entry) if !entry.is_fired() => entry.label(),
            Some(_) => "released",
            None => "none",
        };
        write!(
            f,
            "{}[address={:#x},position={},limit={},capacity={},releaser={}]",
            self.kind,
            self.address(),
            self.position,
            self.limit,
            self.capacity,
            releaser
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_fields() {
        let h = NativeHandle::null(HandleKind::INT);
        assert!(h.is_null());
        assert_eq!(h.reference_count(), -1);
        assert!(!h.release_reference());
        assert_eq!(h.tracked_bytes(), 0);
        assert_eq!(h.to_string(), "int[address=0x0,position=0,limit=0,capacity=0,releaser=none]");
    }

    #[test]
    fn test_fluent_setters() {
        let mut h = NativeHandle::null(HandleKind::BYTE);
        h.set_position(5).set_limit(20);
        assert_eq!(h.position(), 5);
        assert_eq!(h.limit(), 20);

        h.set_capacity(30);
        assert_eq!(h.capacity(), 30);
        assert_eq!(h.limit(), 30);
        assert_eq!(h.position(), 5);
    }

    #[test]
    fn test_null_memory_ops_fail() {
        let mut h = NativeHandle::null(HandleKind::BYTE);
        assert!(matches!(h.fill(1), Err(Error::NullResource("fill"))));
        assert!(matches!(h.to_vec(), Err(Error::NullResource("to_vec"))));
    }

    #[test]
    fn test_opaque_sizeof_needs_metadata() {
        let h = NativeHandle::null(HandleKind::opaque("handle_test_unregistered"));
        assert!(matches!(
            h.sizeof(),
            Err(Error::TypeMetadataUnavailable { .. })
        ));

        TypeLayouts::global().register_sizeof("handle_test_registered", 24);
        TypeLayouts::global().register("handle_test_registered", "next", 16);
        let h = NativeHandle::null(HandleKind::opaque("handle_test_registered"));
        assert_eq!(h.sizeof().unwrap(), 24);
        assert_eq!(h.offsetof("next").unwrap(), 16);
        assert!(h.offsetof("prev").is_err());
    }
}
