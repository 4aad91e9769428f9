//! Process memory sampling.
//!
//! Sampling is split in two: a background task calls
//! [`MemorySampler::refresh`] on a timer, and the monitor reads the last
//! sample with [`MemorySampler::resident_bytes`] around every operation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Source of the current process's resident memory.
pub trait MemorySampler: Send + Sync {
    /// Most recent resident set size in bytes, or `None` if unavailable.
    /// Called twice per monitored operation and must not block.
    fn resident_bytes(&self) -> Option<u64>;

    /// Take a fresh sample. May block briefly; runs off the request path.
    fn refresh(&self) {}
}

/// Samples this process through `sysinfo`.
pub struct ProcessMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
    /// Zero until the first successful refresh.
    latest: AtomicU64,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve current pid, memory sampling disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            latest: AtomicU64::new(0),
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        match self.latest.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    fn refresh(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        let bytes = {
            let mut system = self.system.lock();
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map(|p| p.memory())
        };
        self.latest.store(bytes.unwrap_or(0), Ordering::Relaxed);
    }
}

/// Sampler used when memory sampling is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl MemorySampler for NoopSampler {
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reports_nothing() {
        NoopSampler.refresh();
        assert_eq!(NoopSampler.resident_bytes(), None);
    }

    #[test]
    fn process_sampler_reports_nothing_until_refreshed() {
        let sampler = ProcessMemorySampler::new();
        assert_eq!(sampler.resident_bytes(), None);

        sampler.refresh();
        if let Some(bytes) = sampler.resident_bytes() {
            assert!(bytes > 0);
            assert_eq!(sampler.resident_bytes(), Some(bytes), "reads do not resample");
        }
    }
}
