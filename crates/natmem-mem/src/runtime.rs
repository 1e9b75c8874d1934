//! Runtime: the service owning the registry, collector bridge, and governor.
//!
//! One runtime can be installed process-wide (`Runtime::init` /
//! `Runtime::global`); tests and embedders build their own with
//! `Runtime::builder()`. Every handle keeps the runtime internals it was
//! registered with alive, so handles may outlive the `Runtime` value.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;
use serde::Serialize;

use natmem_core::budget::{HostCollector, MemoryProbe, NoopCollector};
use natmem_core::config::{CollectorMode, RuntimeConfig};
use natmem_core::kind::HandleKind;

use crate::bridge::{spawn_worker, CollectorBridge};
use crate::error::{Error, Result};
use crate::governor::BudgetGovernor;
use crate::handle::{element_size, NativeHandle};
use crate::native::{native_layout, NativeAllocator, SystemAllocator};
use crate::probe::ProcessMemoryProbe;
use crate::registry::{invoke, lock, Entry, Registry};
use crate::releaser::{CustomReleaser, DirectReleaser, ProxyReleaser, Releaser};
use crate::scope;

static GLOBAL: OnceCell<Runtime> = OnceCell::new();

/// Release routine registered for a handle kind.
pub type ReleaseRoutine = Arc<dyn Fn(usize) -> Result<()> + Send + Sync>;

/// State shared by the runtime, its entries, and the collector worker.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: Registry,
    pub(crate) bridge: CollectorBridge,
    pub(crate) governor: BudgetGovernor,
    pub(crate) allocator: Arc<dyn NativeAllocator>,
    pub(crate) probe: Box<dyn MemoryProbe>,
    pub(crate) collector: Box<dyn HostCollector>,
    routines: RwLock<HashMap<&'static str, ReleaseRoutine>>,
    closed: AtomicBool,
}

/// Point-in-time counters, serializable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub tracked_bytes: usize,
    pub peak_tracked_bytes: usize,
    pub live_entries: usize,
    pub pending_finalizations: usize,
    pub finalized: u64,
    pub max_bytes: usize,
    pub max_physical_bytes: usize,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    allocator: Option<Arc<dyn NativeAllocator>>,
    probe: Option<Box<dyn MemoryProbe>>,
    collector: Option<Box<dyn HostCollector>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn allocator(mut self, allocator: impl NativeAllocator) -> Self {
        self.allocator = Some(Arc::new(allocator));
        self
    }

    pub fn shared_allocator(mut self, allocator: Arc<dyn NativeAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn memory_probe(mut self, probe: impl MemoryProbe) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn host_collector(mut self, collector: impl HostCollector) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    pub fn build(self) -> Runtime {
        let config = self.config;
        let shared = Arc::new(Shared {
            registry: Registry::new(),
            bridge: CollectorBridge::new(config.collector),
            governor: BudgetGovernor::from_config(&config),
            allocator: self.allocator.unwrap_or_else(|| Arc::new(SystemAllocator)),
            probe: self
                .probe
                .unwrap_or_else(|| Box::new(ProcessMemoryProbe::new())),
            collector: self.collector.unwrap_or_else(|| Box::new(NoopCollector)),
            routines: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config,
        });

        let worker = if shared.config.collector == CollectorMode::Deferred
            && shared.config.collector_worker
        {
            match spawn_worker(Arc::clone(&shared)) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn collector worker; running without it");
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            collector = %shared.config.collector,
            max_bytes = shared.config.max_bytes,
            max_physical_bytes = shared.config.max_physical_bytes,
            max_retries = shared.config.max_retries,
            "runtime started"
        );

        Runtime {
            shared,
            worker: Mutex::new(worker),
        }
    }
}

pub struct Runtime {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            allocator: None,
            probe: None,
            collector: None,
        }
    }

    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Install the process-wide runtime. Fails if one is already installed.
    pub fn init(config: RuntimeConfig) -> Result<&'static Runtime> {
        let mut installed = false;
        let rt = GLOBAL.get_or_init(|| {
            installed = true;
            Runtime::new(config)
        });
        if installed {
            Ok(rt)
        } else {
            Err(Error::AlreadyInitialized)
        }
    }

    /// The process-wide runtime, configured from the environment on first use.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn collector_mode(&self) -> CollectorMode {
        self.shared.bridge.mode()
    }

    /// Allocate `n` zeroed elements of `kind`.
    pub fn allocate(&self, kind: HandleKind, n: usize) -> Result<NativeHandle> {
        self.ensure_open()?;
        let size = element_size(kind)?;
        if n == 0 {
            return Ok(NativeHandle::null(kind));
        }

        let out_of_resource = |bytes| Error::OutOfResource {
            kind: kind.name(),
            bytes,
        };
        let bytes = n.checked_mul(size).ok_or(out_of_resource(usize::MAX))?;
        let layout = native_layout(bytes).ok_or(out_of_resource(bytes))?;
        let address = self.shared.allocator.allocate(layout);
        if address == 0 {
            return Err(out_of_resource(bytes));
        }

        // SAFETY: address was just produced by this allocator for `layout`.
        let releaser =
            unsafe { DirectReleaser::new(Arc::clone(&self.shared.allocator), address, layout) };
        let entry = self.register(kind, bytes, Box::new(releaser), None)?;
        let handle = NativeHandle::owned(kind, address, n, bytes, entry);
        Ok(self.auto_attach(handle))
    }

    /// A second handle onto `other`'s memory that keeps `other` alive.
    ///
    /// Releasing the reference explicitly releases `other` too; dropping it
    /// only lets go of `other`. If `other` owns nothing, the result is a
    /// plain copy with no releaser.
    pub fn reference(&self, other: &NativeHandle) -> Result<NativeHandle> {
        self.ensure_open()?;
        let mut handle = other.unowned_copy();
        let Some(source) = other.entry().filter(|e| !e.is_fired()) else {
            return Ok(handle);
        };

        let bytes = other.capacity().saturating_mul(element_size(other.kind())?);
        let upstream = Arc::downgrade(source);
        let releaser = ProxyReleaser::delegating(Arc::clone(source));
        let entry = self.register(other.kind(), bytes, Box::new(releaser), Some(upstream))?;
        handle.set_entry(entry);
        Ok(self.auto_attach(handle))
    }

    /// A handle over a host buffer, which stays alive until the handle is released.
    pub fn view<T>(&self, kind: HandleKind, buffer: Vec<T>) -> Result<NativeHandle>
    where
        T: Copy + Send + 'static,
    {
        self.ensure_open()?;
        let size = element_size(kind)?;
        if size != mem::size_of::<T>() {
            return Err(Error::ElementSizeMismatch {
                kind: kind.name(),
                expected: size,
                actual: mem::size_of::<T>(),
            });
        }
        if buffer.is_empty() {
            return Ok(NativeHandle::null(kind));
        }

        let address = buffer.as_ptr() as usize;
        let len = buffer.len();
        let entry = self.register(kind, len * size, Box::new(ProxyReleaser::new(buffer)), None)?;
        let handle = NativeHandle::owned(kind, address, len, len * size, entry);
        Ok(self.auto_attach(handle))
    }

    /// Take ownership of foreign memory released by `routine`.
    ///
    /// # Safety
    /// `address` must point to at least `capacity` elements of `kind` that
    /// stay valid until `routine` runs, and nothing else may free them.
    pub unsafe fn adopt<F>(
        &self,
        kind: HandleKind,
        address: usize,
        capacity: usize,
        routine: F,
    ) -> Result<NativeHandle>
    where
        F: FnOnce(usize) -> Result<()> + Send + 'static,
    {
        // SAFETY: forwarded contract.
        unsafe { self.adopt_with(kind, address, capacity, CustomReleaser::new(address, routine)) }
    }

    /// Take ownership of foreign memory with an arbitrary releaser.
    ///
    /// On failure the releaser has already run, except for a null `address`
    /// where there is nothing to release.
    ///
    /// # Safety
    /// Same contract as [`Runtime::adopt`].
    pub unsafe fn adopt_with<R>(
        &self,
        kind: HandleKind,
        address: usize,
        capacity: usize,
        releaser: R,
    ) -> Result<NativeHandle>
    where
        R: Releaser + 'static,
    {
        if address == 0 {
            return Err(Error::NullResource("adopt"));
        }
        let releaser: Box<dyn Releaser> = Box::new(releaser);
        let size = match element_size(kind) {
            Ok(size) => size,
            Err(e) => {
                invoke(self.shared.registry.next_id(), releaser);
                return Err(e);
            }
        };

        let bytes = capacity.saturating_mul(size);
        let entry = self.register(kind, bytes, releaser, None)?;
        let handle = NativeHandle::owned(kind, address, capacity, bytes, entry);
        Ok(self.auto_attach(handle))
    }

    /// Register the routine that frees native objects of `kind`.
    pub fn register_release_routine<F>(&self, kind: HandleKind, routine: F)
    where
        F: Fn(usize) -> Result<()> + Send + Sync + 'static,
    {
        self.shared
            .routines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.name(), Arc::new(routine));
    }

    /// Adopt foreign memory using the routine registered for `kind`.
    ///
    /// # Safety
    /// Same contract as [`Runtime::adopt`].
    pub unsafe fn adopt_registered(
        &self,
        kind: HandleKind,
        address: usize,
        capacity: usize,
    ) -> Result<NativeHandle> {
        let routine = self
            .shared
            .routines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind.name())
            .cloned()
            .ok_or_else(|| Error::TypeMetadataUnavailable {
                kind: kind.name().to_string(),
                member: "release".to_string(),
            })?;
        // SAFETY: forwarded contract.
        unsafe { self.adopt(kind, address, capacity, move |a| routine(a)) }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    fn register(
        &self,
        kind: HandleKind,
        bytes: usize,
        releaser: Box<dyn Releaser>,
        upstream: Option<Weak<Entry>>,
    ) -> Result<Arc<Entry>> {
        let entry = Arc::new(Entry::new(
            Arc::clone(&self.shared),
            kind,
            bytes,
            releaser,
            upstream,
        ));
        if self.shared.closed.load(Ordering::Acquire) {
            entry.abandon();
            return Err(Error::ShutDown);
        }
        self.shared.governor.admit(&self.shared, &entry)?;
        tracing::trace!(id = %entry.id(), %kind, bytes, releaser = entry.label(), "registered");
        Ok(entry)
    }

    fn auto_attach(&self, handle: NativeHandle) -> NativeHandle {
        scope::auto_attach(&handle);
        handle
    }

    /// Sum of tracked bytes of all registered, not yet fired releasers.
    pub fn total_tracked_bytes(&self) -> usize {
        self.shared.registry.total_bytes()
    }

    pub fn peak_tracked_bytes(&self) -> usize {
        self.shared.registry.peak_bytes()
    }

    pub fn max_bytes(&self) -> usize {
        self.shared.governor.max_bytes()
    }

    pub fn max_physical_bytes(&self) -> usize {
        self.shared.governor.max_physical_bytes()
    }

    pub fn max_retries(&self) -> usize {
        self.shared.governor.max_retries()
    }

    pub fn physical_bytes(&self) -> usize {
        self.shared.probe.physical_bytes()
    }

    /// Registered entries, including those waiting in the finalization queue.
    pub fn live_entries(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn pending_finalizations(&self) -> usize {
        self.shared.bridge.pending()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            tracked_bytes: self.total_tracked_bytes(),
            peak_tracked_bytes: self.peak_tracked_bytes(),
            live_entries: self.live_entries(),
            pending_finalizations: self.pending_finalizations(),
            finalized: self.shared.bridge.finalized(),
            max_bytes: self.max_bytes(),
            max_physical_bytes: self.max_physical_bytes(),
        }
    }

    /// Release every queued unreachable handle now, in any collector mode.
    pub fn collect(&self) -> usize {
        self.shared.bridge.drain(&self.shared.registry)
    }

    /// Stop the worker and release everything still registered.
    ///
    /// Handles that survive shutdown read as null; new allocations fail.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.bridge.stop();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("collector worker panicked");
            }
        }

        let drained = self.collect();
        let live = self.shared.registry.live_entries();
        let fired = live.iter().filter(|e| e.fire()).count();
        drop(live);
        tracing::debug!(drained, fired, "runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("collector", &self.collector_mode())
            .field("stats", &self.stats())
            .finish()
    }
}
