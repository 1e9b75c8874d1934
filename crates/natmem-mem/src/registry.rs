//! Global registry of live releasers.
//!
//! Every handle that owns a releaser has one [`Entry`]. The registry keeps a
//! weak link to each entry plus the running total of tracked bytes, both
//! behind one mutex. The entry's releaser slot is the exactly-once latch
//! shared by every release path.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use natmem_core::id::EntryId;
use natmem_core::kind::HandleKind;

use crate::bridge::Pending;
use crate::refcount::RefCount;
use crate::releaser::Releaser;
use crate::runtime::Shared;
use crate::tracking::PeakTracker;

/// Lock ignoring poison: a panicking releaser must not wedge the runtime.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a releaser, swallowing failures and panics with a diagnostic.
pub(crate) fn invoke(id: EntryId, releaser: Box<dyn Releaser>) {
    run(id, releaser, |r| r.release());
}

/// Like [`invoke`], for releasers nobody asked to release.
pub(crate) fn invoke_unreachable(id: EntryId, releaser: Box<dyn Releaser>) {
    run(id, releaser, |r| r.release_unreachable());
}

fn run(
    id: EntryId,
    mut releaser: Box<dyn Releaser>,
    release: impl FnOnce(&mut dyn Releaser) -> crate::error::Result<()>,
) {
    let label = releaser.label();
    match panic::catch_unwind(AssertUnwindSafe(|| release(releaser.as_mut()))) {
        Ok(Ok(())) => tracing::trace!(%id, releaser = label, "released"),
        Ok(Err(e)) => tracing::warn!(%id, releaser = label, error = %e, "releaser failed"),
        Err(_) => tracing::error!(%id, releaser = label, "releaser panicked"),
    }
}

struct Record {
    bytes: usize,
    entry: Weak<Entry>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<EntryId, Record>,
    total_bytes: usize,
}

pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    peak: PeakTracker,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(0),
            peak: PeakTracker::new(),
        }
    }

    pub(crate) fn next_id(&self) -> EntryId {
        EntryId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Link `entry` if `admit(current_total)` allows it.
    ///
    /// The check and the insert happen under the same lock, so concurrent
    /// admissions never both pass against a stale total. Returns the new
    /// total on success and the observed total on refusal.
    pub(crate) fn try_commit(
        &self,
        entry: &Arc<Entry>,
        admit: impl FnOnce(usize) -> bool,
    ) -> std::result::Result<usize, usize> {
        let mut state = lock(&self.state);
        if !admit(state.total_bytes) {
            return Err(state.total_bytes);
        }
        state.total_bytes = state.total_bytes.saturating_add(entry.bytes);
        state.records.insert(
            entry.id,
            Record {
                bytes: entry.bytes,
                entry: Arc::downgrade(entry),
            },
        );
        let total = state.total_bytes;
        drop(state);
        self.peak.record_used(total);
        Ok(total)
    }

    /// Unlink an entry and give its bytes back. False if it was not linked.
    pub(crate) fn unlink(&self, id: EntryId) -> bool {
        let mut state = lock(&self.state);
        match state.records.remove(&id) {
            Some(record) => {
                state.total_bytes = state.total_bytes.saturating_sub(record.bytes);
                true
            }
            None => false,
        }
    }

    pub(crate) fn total_bytes(&self) -> usize {
        lock(&self.state).total_bytes
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub(crate) fn peak_bytes(&self) -> usize {
        self.peak.peak()
    }

    /// Entries that still have an owner somewhere.
    pub(crate) fn live_entries(&self) -> Vec<Arc<Entry>> {
        lock(&self.state)
            .records
            .values()
            .filter_map(|r| r.entry.upgrade())
            .collect()
    }
}

/// One registered releaser plus its reference count.
pub(crate) struct Entry {
    id: EntryId,
    kind: HandleKind,
    bytes: usize,
    label: &'static str,
    slot: Mutex<Option<Box<dyn Releaser>>>,
    fired: AtomicBool,
    refs: RefCount,
    /// Entry a proxy keeps alive; the proxy is only usable while it is.
    upstream: Option<Weak<Entry>>,
    shared: Arc<Shared>,
}

impl Entry {
    pub(crate) fn new(
        shared: Arc<Shared>,
        kind: HandleKind,
        bytes: usize,
        releaser: Box<dyn Releaser>,
        upstream: Option<Weak<Entry>>,
    ) -> Self {
        Self {
            id: shared.registry.next_id(),
            kind,
            bytes,
            label: releaser.label(),
            slot: Mutex::new(Some(releaser)),
            fired: AtomicBool::new(false),
            refs: RefCount::new(),
            upstream,
            shared,
        }
    }

    pub(crate) fn id(&self) -> EntryId {
        self.id
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Not fired, and neither is anything it proxies for.
    pub(crate) fn is_live(&self) -> bool {
        if self.is_fired() {
            return false;
        }
        match &self.upstream {
            None => true,
            Some(up) => up.upgrade().is_some_and(|u| u.is_live()),
        }
    }

    fn take_releaser(&self) -> Option<Box<dyn Releaser>> {
        let mut slot = lock(&self.slot);
        let releaser = slot.take();
        if releaser.is_some() {
            self.fired.store(true, Ordering::Release);
        }
        releaser
    }

    /// Release now. Only the first caller across all paths gets `true`.
    pub(crate) fn fire(&self) -> bool {
        let Some(releaser) = self.take_releaser() else {
            return false;
        };
        invoke(self.id, releaser);
        self.shared.registry.unlink(self.id);
        true
    }

    /// Release a candidate that never became reachable: refused admission or
    /// registered after shutdown.
    pub(crate) fn abandon(&self) -> bool {
        let Some(releaser) = self.take_releaser() else {
            return false;
        };
        invoke_unreachable(self.id, releaser);
        self.shared.registry.unlink(self.id);
        true
    }

    /// Unlink without releasing; the caller takes over the resource.
    pub(crate) fn detach(&self) -> bool {
        let Some(releaser) = self.take_releaser() else {
            return false;
        };
        drop(releaser);
        self.shared.registry.unlink(self.id);
        tracing::trace!(id = %self.id, "detached without release");
        true
    }

    pub(crate) fn retain(&self) {
        if !self.is_fired() {
            self.refs.retain();
        }
    }

    /// Drop one count; fire when it reaches zero or below.
    pub(crate) fn release(&self) -> bool {
        if self.is_fired() {
            return false;
        }
        if self.refs.release() <= 0 {
            self.fire()
        } else {
            false
        }
    }

    pub(crate) fn count(&self) -> i32 {
        if self.is_fired() {
            -1
        } else {
            self.refs.get()
        }
    }

    /// Run `f` while holding the release latch of this entry and its
    /// upstream chain, so the memory cannot be freed underneath it.
    pub(crate) fn with_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let slot = lock(&self.slot);
        if slot.is_none() {
            return None;
        }
        let result = match &self.upstream {
            None => Some(f()),
            Some(up) => up.upgrade().and_then(|u| u.with_live(f)),
        };
        drop(slot);
        result
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let releaser = self
            .slot
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(releaser) = releaser {
            self.shared.bridge.unreachable(
                Pending {
                    id: self.id,
                    releaser,
                },
                &self.shared.registry,
            );
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes)
            .field("releaser", &self.label)
            .field("fired", &self.is_fired())
            .field("refs", &self.refs.get())
            .finish()
    }
}
