//! Handle scopes: deterministic batch release with stack discipline.
//!
//! Opening a scope pushes it onto a per-thread stack. Every handle registered
//! on that thread while scopes are open is attached to the innermost one that
//! accepts its kind, which takes an explicit reference on it. Closing a scope
//! drops those references newest first; `extend` makes the next close keep
//! them instead.
//!
//! `HandleScope` is `!Send`: a scope is closed on the thread that opened it.
//! Extending a scope that is not the innermost is allowed but only defers
//! that scope's own close.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use natmem_core::id::ScopeId;
use natmem_core::kind::HandleKind;

use crate::error::{Error, Result};
use crate::handle::NativeHandle;
use crate::registry::Entry;

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SCOPES: RefCell<Vec<Rc<ScopeState>>> = const { RefCell::new(Vec::new()) };
}

/// What a scope holds for one attached handle.
struct Member {
    entry: Option<Arc<Entry>>,
    kind: HandleKind,
    address: usize,
    position: usize,
}

impl Member {
    fn of(handle: &NativeHandle) -> Self {
        Self {
            entry: handle.entry().cloned(),
            kind: handle.kind(),
            address: handle.address(),
            position: handle.position(),
        }
    }

    fn matches(&self, handle: &NativeHandle) -> bool {
        match (&self.entry, handle.entry()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => {
                self.kind == handle.kind()
                    && self.address == handle.address()
                    && self.position == handle.position()
            }
            _ => false,
        }
    }

    fn release(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| e.release())
    }

    fn fire(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| e.fire())
    }
}

struct ScopeState {
    id: ScopeId,
    kinds: Vec<HandleKind>,
    members: RefCell<Vec<Member>>,
    extend: Cell<bool>,
    open: Cell<bool>,
}

impl ScopeState {
    fn accepts(&self, kind: HandleKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    fn push(&self, handle: &NativeHandle) {
        tracing::debug!(scope = %self.id, %handle, "attaching");
        self.members.borrow_mut().push(Member::of(handle));
        handle.retain_reference();
    }

    fn pop(&self) -> Option<Member> {
        self.members.borrow_mut().pop()
    }
}

pub struct HandleScope {
    state: Rc<ScopeState>,
}

impl HandleScope {
    /// Open a scope accepting every kind.
    pub fn open() -> Self {
        Self::for_kinds(&[])
    }

    /// Open a scope accepting only `kinds` (all kinds when empty).
    pub fn for_kinds(kinds: &[HandleKind]) -> Self {
        let state = Rc::new(ScopeState {
            id: ScopeId::new(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed)),
            kinds: kinds.to_vec(),
            members: RefCell::new(Vec::new()),
            extend: Cell::new(false),
            open: Cell::new(true),
        });
        tracing::debug!(scope = %state.id, ?kinds, "opening scope");
        SCOPES.with(|stack| stack.borrow_mut().push(Rc::clone(&state)));
        Self { state }
    }

    /// Number of scopes open on this thread.
    pub fn depth() -> usize {
        SCOPES.try_with(|stack| stack.borrow().len()).unwrap_or(0)
    }

    /// Id of the innermost scope open on this thread.
    pub fn innermost() -> Option<ScopeId> {
        SCOPES
            .try_with(|stack| stack.borrow().last().map(|s| s.id))
            .ok()
            .flatten()
    }

    /// Ids of the scopes open on this thread, innermost first.
    pub fn open_scopes() -> Vec<ScopeId> {
        SCOPES
            .try_with(|stack| stack.borrow().iter().rev().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    pub fn id(&self) -> ScopeId {
        self.state.id
    }

    pub fn kinds(&self) -> &[HandleKind] {
        &self.state.kinds
    }

    pub fn accepts(&self, kind: HandleKind) -> bool {
        self.state.accepts(kind)
    }

    /// Still on this thread's scope stack.
    pub fn is_open(&self) -> bool {
        self.state.open.get()
    }

    pub fn len(&self) -> usize {
        self.state.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a reference on `handle`, released when this scope closes.
    pub fn attach(&self, handle: &NativeHandle) -> Result<&Self> {
        if !self.accepts(handle.kind()) {
            return Err(Error::CapabilityMismatch {
                kind: handle.kind().name(),
                scope: self.state.id,
                allowed: self.state.kinds.iter().map(|k| k.name()).collect(),
            });
        }
        self.state.push(handle);
        Ok(self)
    }

    /// Forget `handle` (newest attachment first) and drop one reference on it.
    pub fn detach(&self, handle: &NativeHandle) -> &Self {
        tracing::debug!(scope = %self.state.id, %handle, "detaching");
        let removed = {
            let mut members = self.state.members.borrow_mut();
            members
                .iter()
                .rposition(|m| m.matches(handle))
                .map(|i| members.remove(i))
        };
        handle.release_reference();
        drop(removed);
        self
    }

    /// Make the next `close` keep every member alive.
    pub fn extend(&self) -> &Self {
        tracing::debug!(scope = %self.state.id, "extending");
        self.state.extend.set(true);
        self
    }

    /// Leave the scope stack, releasing members newest first unless extended.
    pub fn close(&self) {
        let state = &self.state;
        if state.extend.replace(false) {
            tracing::debug!(scope = %state.id, kept = self.len(), "closing extended scope");
        } else {
            tracing::debug!(scope = %state.id, members = self.len(), "closing scope");
            while let Some(member) = state.pop() {
                member.release();
            }
        }
        state.open.set(false);
        remove_from_stack(state.id);
    }

    /// Release every member now, ignoring reference counts.
    pub fn deallocate(&self) {
        tracing::debug!(scope = %self.state.id, members = self.len(), "deallocating scope");
        while let Some(member) = self.state.pop() {
            member.fire();
        }
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        if self.state.open.get() {
            self.close();
        }
    }
}

impl fmt::Debug for HandleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleScope")
            .field("id", &self.state.id)
            .field("kinds", &self.state.kinds)
            .field("members", &self.len())
            .field("extend", &self.state.extend.get())
            .field("open", &self.state.open.get())
            .finish()
    }
}

fn remove_from_stack(id: ScopeId) {
    let removed = SCOPES
        .try_with(|stack| {
            let mut stack = stack.borrow_mut();
            stack
                .iter()
                .rposition(|s| s.id == id)
                .map(|i| stack.remove(i))
        })
        .ok()
        .flatten();
    drop(removed);
}

/// Attach a freshly registered handle to the innermost accepting scope.
pub(crate) fn auto_attach(handle: &NativeHandle) {
    if handle.entry().is_none() {
        return;
    }
    let target = SCOPES
        .try_with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|s| s.accepts(handle.kind()))
                .cloned()
        })
        .ok()
        .flatten();
    if let Some(scope) = target {
        scope.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_depth_tracks_open_scopes() {
        assert_eq!(HandleScope::depth(), 0);
        let outer = HandleScope::open();
        {
            let inner = HandleScope::for_kinds(&[HandleKind::INT]);
            assert_eq!(HandleScope::depth(), 2);
            assert!(inner.accepts(HandleKind::INT));
            assert!(!inner.accepts(HandleKind::FLOAT));
        }
        assert_eq!(HandleScope::depth(), 1);
        assert!(outer.accepts(HandleKind::FLOAT));
        outer.close();
        assert!(!outer.is_open());
        assert_eq!(HandleScope::depth(), 0);
    }

    #[test]
    fn test_out_of_order_close() {
        let a = HandleScope::open();
        let b = HandleScope::open();
        let c = HandleScope::open();
        assert_eq!(HandleScope::innermost(), Some(c.id()));
        b.close();
        assert_eq!(HandleScope::depth(), 2);
        assert_eq!(HandleScope::open_scopes(), vec![c.id(), a.id()]);
        assert!(a.is_open() && c.is_open());
        drop(c);
        assert_eq!(HandleScope::innermost(), Some(a.id()));
        drop(a);
        assert_eq!(HandleScope::depth(), 0);
        assert_eq!(HandleScope::innermost(), None);
    }

    #[test]
    fn test_mismatch_reports_allowed_kinds() {
        let scope = HandleScope::for_kinds(&[HandleKind::INT]);
        let h = NativeHandle::null(HandleKind::FLOAT);
        match scope.attach(&h) {
            Err(Error::CapabilityMismatch { kind, allowed, .. }) => {
                assert_eq!(kind, "float");
                assert_eq!(allowed, vec!["int"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(scope.is_empty());
    }
}
