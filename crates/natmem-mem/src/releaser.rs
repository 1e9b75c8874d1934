//! Release capabilities: how one native resource gets freed.
//!
//! A releaser is handed to the registry when a handle is created and is
//! invoked at most once, from whichever path gets there first (explicit
//! release, scope close, or the collector bridge). The collector bridge
//! calls `release_unreachable`, which only differs for proxies.

use std::alloc::Layout;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::native::NativeAllocator;
use crate::registry::Entry;

pub trait Releaser: Send {
    /// Free the resource. The registry guarantees a single call.
    fn release(&mut self) -> Result<()>;

    /// Called instead of `release` when the last owner went away, or when
    /// registration was refused, without anyone asking for a release.
    fn release_unreachable(&mut self) -> Result<()> {
        self.release()
    }

    /// Short name for diagnostics.
    fn label(&self) -> &'static str {
        "releaser"
    }
}

/// Frees a block through the allocator that produced it.
pub struct DirectReleaser {
    allocator: Arc<dyn NativeAllocator>,
    address: usize,
    layout: Layout,
}

impl DirectReleaser {
    /// # Safety
    /// `address` must have been returned by `allocator.allocate(layout)` and
    /// must not be owned by anything else.
    pub unsafe fn new(allocator: Arc<dyn NativeAllocator>, address: usize, layout: Layout) -> Self {
        Self {
            allocator,
            address,
            layout,
        }
    }
}

impl Releaser for DirectReleaser {
    fn release(&mut self) -> Result<()> {
        if self.address != 0 {
            let address = std::mem::replace(&mut self.address, 0);
            // SAFETY: construction contract; address is cleared so it is freed once.
            unsafe { self.allocator.release(address, self.layout) };
        }
        Ok(())
    }

    fn label(&self) -> &'static str {
        "direct"
    }
}

pub type ReleaseFn = Box<dyn FnOnce(usize) -> Result<()> + Send>;

/// Runs a caller-supplied routine with the resource address.
pub struct CustomReleaser {
    address: usize,
    routine: Option<ReleaseFn>,
}

impl CustomReleaser {
    pub fn new<F>(address: usize, routine: F) -> Self
    where
        F: FnOnce(usize) -> Result<()> + Send + 'static,
    {
        Self {
            address,
            routine: Some(Box::new(routine)),
        }
    }
}

impl Releaser for CustomReleaser {
    fn release(&mut self) -> Result<()> {
        match self.routine.take() {
            Some(routine) => routine(self.address),
            None => Ok(()),
        }
    }

    fn label(&self) -> &'static str {
        "custom"
    }
}

/// Owns nothing native; keeps a source alive until released.
///
/// The source is either another handle's registry entry (for reference
/// handles) or a host buffer (for views). An explicit release of a reference
/// releases its source; for a view it only drops the hold on the buffer.
/// Going unreachable always just drops the hold, letting the source follow
/// its own release path.
pub struct ProxyReleaser {
    source: Option<Source>,
}

enum Source {
    Value(Box<dyn Any + Send>),
    Entry(Arc<Entry>),
}

impl ProxyReleaser {
    pub fn new<T: Any + Send>(source: T) -> Self {
        Self {
            source: Some(Source::Value(Box::new(source))),
        }
    }

    /// Proxy for another handle's registry entry.
    pub(crate) fn delegating(source: Arc<Entry>) -> Self {
        Self {
            source: Some(Source::Entry(source)),
        }
    }
}

impl Releaser for ProxyReleaser {
    fn release(&mut self) -> Result<()> {
        if let Some(Source::Entry(entry)) = self.source.take() {
            entry.fire();
        }
        Ok(())
    }

    fn release_unreachable(&mut self) -> Result<()> {
        drop(self.source.take());
        Ok(())
    }

    fn label(&self) -> &'static str {
        "proxy"
    }
}

impl fmt::Debug for dyn Releaser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_custom_runs_routine_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut r = CustomReleaser::new(0x40, move |addr| {
            assert_eq!(addr, 0x40);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        r.release().unwrap();
        r.release().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.label(), "custom");
    }

    #[test]
    fn test_proxy_drops_source() {
        let source = Arc::new(());
        let mut r = ProxyReleaser::new(Arc::clone(&source));
        assert_eq!(Arc::strong_count(&source), 2);
        r.release_unreachable().unwrap();
        assert_eq!(Arc::strong_count(&source), 1);
    }

    #[test]
    fn test_proxy_release_drops_buffer_hold() {
        let buffer = Arc::new(vec![0u8; 16]);
        let mut r = ProxyReleaser::new(Arc::clone(&buffer));
        r.release().unwrap();
        assert_eq!(Arc::strong_count(&buffer), 1);
        assert_eq!(r.label(), "proxy");
    }
}
