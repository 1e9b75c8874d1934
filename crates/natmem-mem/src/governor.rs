//! Budget governor: admission control for new registry entries.
//!
//! An entry is linked only if the tracked total stays under `max_bytes` and
//! resident memory is under `max_physical_bytes`. Otherwise the allocating
//! thread forces collections and retries; when retries run out the
//! candidate is released as unreachable and the caller gets
//! `ResourceBudgetExceeded`. The physical ceiling applies to every entry,
//! whatever its size.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use natmem_core::budget::Ceiling;
use natmem_core::config::{CollectorMode, RuntimeConfig};

use crate::error::{Error, Result};
use crate::registry::Entry;
use crate::runtime::Shared;

#[derive(Debug, Clone)]
pub(crate) struct BudgetGovernor {
    max_bytes: usize,
    max_physical_bytes: usize,
    max_retries: usize,
    retry_pause: Duration,
}

impl BudgetGovernor {
    pub(crate) fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            max_bytes: cfg.max_bytes,
            max_physical_bytes: cfg.max_physical_bytes,
            max_retries: cfg.max_retries,
            retry_pause: cfg.retry_pause(),
        }
    }

    pub(crate) fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub(crate) fn max_physical_bytes(&self) -> usize {
        self.max_physical_bytes
    }

    pub(crate) fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Link `entry` into the registry, or abandon it and fail.
    ///
    /// Blocks the caller across retries; there is no cancellation.
    pub(crate) fn admit(&self, shared: &Shared, entry: &Arc<Entry>) -> Result<()> {
        let requested = entry.bytes();
        let max_bytes = self.max_bytes;
        let mut attempt = 0;
        loop {
            let physical = self.measure(shared);
            let physical_ok = self.max_physical_bytes == 0 || physical <= self.max_physical_bytes;
            let committed = shared.registry.try_commit(entry, |total| {
                physical_ok && (max_bytes == 0 || total.saturating_add(requested) <= max_bytes)
            });

            let total = match committed {
                Ok(total) => {
                    if attempt > 0 {
                        tracing::debug!(
                            id = %entry.id(),
                            attempt,
                            total,
                            "admitted after forced collection"
                        );
                    }
                    return Ok(());
                }
                Err(total) => total,
            };

            if attempt >= self.max_retries {
                let ceiling = if max_bytes > 0 && total.saturating_add(requested) > max_bytes {
                    Ceiling::TrackedBytes
                } else {
                    Ceiling::PhysicalBytes
                };
                entry.abandon();
                tracing::warn!(
                    %ceiling,
                    requested,
                    total,
                    max_bytes,
                    physical,
                    max_physical_bytes = self.max_physical_bytes,
                    retries = attempt,
                    "admission refused"
                );
                return Err(Error::ResourceBudgetExceeded {
                    ceiling,
                    requested,
                    tracked_bytes: total,
                    max_bytes,
                    physical_bytes: physical,
                    max_physical_bytes: self.max_physical_bytes,
                    retries: attempt,
                });
            }

            attempt += 1;
            tracing::info!(
                attempt,
                max_retries = self.max_retries,
                requested,
                total,
                physical,
                "over budget, forcing collection"
            );
            self.force_collection(shared);
        }
    }

    fn measure(&self, shared: &Shared) -> usize {
        if self.max_physical_bytes > 0 {
            shared.probe.physical_bytes()
        } else {
            0
        }
    }

    fn force_collection(&self, shared: &Shared) {
        shared.collector.collect();
        if shared.bridge.mode() != CollectorMode::Disabled {
            shared.bridge.drain(&shared.registry);
        }
        if !self.retry_pause.is_zero() {
            thread::sleep(self.retry_pause);
        }
        shared.allocator.trim();
    }
}
