//! Resident-memory probe for the physical ceiling.

use natmem_core::budget::MemoryProbe;

#[cfg(feature = "physical-probe")]
mod imp {
    use std::sync::Mutex;

    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    use crate::registry::lock;

    pub struct ProcessMemoryProbe {
        system: Mutex<System>,
        pid: Option<Pid>,
    }

    impl ProcessMemoryProbe {
        pub fn new() -> Self {
            Self {
                system: Mutex::new(System::new()),
                pid: sysinfo::get_current_pid().ok(),
            }
        }

        pub(super) fn resident_bytes(&self) -> usize {
            let Some(pid) = self.pid else {
                return 0;
            };
            let mut system = lock(&self.system);
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            system
                .process(pid)
                .map(|p| p.memory() as usize)
                .unwrap_or(0)
        }
    }
}

#[cfg(not(feature = "physical-probe"))]
mod imp {
    /// Without `physical-probe` nothing is measured and the ceiling never trips.
    pub struct ProcessMemoryProbe;

    impl ProcessMemoryProbe {
        pub fn new() -> Self {
            Self
        }

        pub(super) fn resident_bytes(&self) -> usize {
            0
        }
    }
}

pub use imp::ProcessMemoryProbe;

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn physical_bytes(&self) -> usize {
        self.resident_bytes()
    }
}
