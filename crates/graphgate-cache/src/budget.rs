//! Byte budget shared by every tier of a coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free byte accounting with an upper bound.
///
/// Every insert reserves its bytes before the entry becomes visible and every
/// removal releases them, so `used() <= limit()` holds at all times.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// A budget that never refuses a reservation.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Reserve `bytes` if that keeps usage within the limit.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    pub fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
