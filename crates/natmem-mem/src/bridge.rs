//! Collector bridge: routes unreachable entries to their releasers.
//!
//! In `Immediate` mode the thread that drops the last owner releases inline.
//! `Deferred` and `Disabled` modes park the releaser in a finalization queue
//! instead; the queue is drained by the background worker (deferred only),
//! by forced collections in the budget governor (deferred only), and by an
//! explicit `Runtime::collect()` (both).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use natmem_core::config::CollectorMode;
use natmem_core::id::EntryId;

use crate::registry::{invoke_unreachable, lock, Registry};
use crate::releaser::Releaser;
use crate::runtime::Shared;

pub(crate) const WORKER_NAME: &str = "natmem-collector";

/// A releaser whose handle became unreachable before it fired.
pub(crate) struct Pending {
    pub(crate) id: EntryId,
    pub(crate) releaser: Box<dyn Releaser>,
}

pub(crate) struct CollectorBridge {
    mode: CollectorMode,
    queue: Mutex<VecDeque<Pending>>,
    ready: Condvar,
    pending: AtomicUsize,
    /// Set under the queue lock; afterwards everything finalizes inline.
    stopping: AtomicBool,
    finalized: AtomicU64,
}

impl CollectorBridge {
    pub(crate) fn new(mode: CollectorMode) -> Self {
        Self {
            mode,
            queue: Mutex::new(VecDeque::with_capacity(16)),
            ready: Condvar::new(),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            finalized: AtomicU64::new(0),
        }
    }

    pub(crate) fn mode(&self) -> CollectorMode {
        self.mode
    }

    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Releasers run through this bridge so far.
    pub(crate) fn finalized(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Called from `Entry::drop` with the releaser still armed.
    pub(crate) fn unreachable(&self, pending: Pending, registry: &Registry) {
        if self.mode == CollectorMode::Immediate {
            self.finalize(pending, registry);
            return;
        }

        let mut queue = lock(&self.queue);
        if self.stopping.load(Ordering::Acquire) {
            drop(queue);
            self.finalize(pending, registry);
            return;
        }
        tracing::trace!(id = %pending.id, "queued for finalization");
        queue.push_back(pending);
        self.pending.fetch_add(1, Ordering::Release);
        drop(queue);
        self.ready.notify_one();
    }

    fn finalize(&self, pending: Pending, registry: &Registry) {
        let id = pending.id;
        invoke_unreachable(id, pending.releaser);
        registry.unlink(id);
        self.finalized.fetch_add(1, Ordering::Relaxed);
    }

    /// Release everything queued right now. Returns how many fired.
    pub(crate) fn drain(&self, registry: &Registry) -> usize {
        if self.pending() == 0 {
            return 0;
        }

        let batch: VecDeque<Pending> = std::mem::take(&mut *lock(&self.queue));
        let count = batch.len();
        self.pending.fetch_sub(count, Ordering::Release);
        for pending in batch {
            self.finalize(pending, registry);
        }

        if count > 0 {
            tracing::trace!(count, "drained finalization queue");
        }
        count
    }

    fn run_worker(&self, registry: &Registry) {
        tracing::debug!("collector worker started");
        loop {
            let batch = {
                let mut queue = lock(&self.queue);
                while queue.is_empty() && !self.stopping.load(Ordering::Acquire) {
                    queue = self
                        .ready
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if queue.is_empty() {
                    break;
                }
                std::mem::take(&mut *queue)
            };

            self.pending.fetch_sub(batch.len(), Ordering::Release);
            for pending in batch {
                self.finalize(pending, registry);
            }
        }
        tracing::debug!("collector worker stopped");
    }

    /// Stop queueing; wakes the worker so it can finish and exit.
    pub(crate) fn stop(&self) {
        let _queue = lock(&self.queue);
        self.stopping.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

pub(crate) fn spawn_worker(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(WORKER_NAME.to_string())
        .spawn(move || shared.bridge.run_worker(&shared.registry))
}
