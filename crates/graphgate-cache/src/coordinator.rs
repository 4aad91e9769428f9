//! Owner of the four cache tiers and their shared memory budget.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use graphgate_core::{AccessConfig, EntityId, TierConfigs, TierKind};

use crate::budget::MemoryBudget;
use crate::tier::{CacheTier, PutOutcome, TierStats};

/// Coordinates the node, search, relationship, and traversal tiers.
///
/// Each tier has its own lock. Paths that need more than one tier lock
/// (invalidation, budget spill-over) take all four in
/// [`TierKind::LOCK_ORDER`], so they cannot deadlock against each other.
/// When the global budget is exhausted, victims are taken from tiers in
/// [`TierKind::EVICTION_ORDER`] (traversal first, node last), least recently
/// used first within a tier.
///
/// Every invalidation advances an epoch. A reader that captured the epoch
/// before going to the backend stores its result with
/// [`CacheCoordinator::put_since`], which refuses the insert if one of the
/// result's dependencies was invalidated in between.
pub struct CacheCoordinator<V> {
    tiers: [CacheTier<V>; 4],
    budget: Arc<MemoryBudget>,
    invalidations: Mutex<InvalidationLog>,
}

/// Number of recent invalidations remembered for [`CacheCoordinator::put_since`].
const INVALIDATION_HISTORY: usize = 1024;

#[derive(Default)]
struct InvalidationLog {
    epoch: u64,
    recent: VecDeque<(u64, Vec<EntityId>)>,
}

impl InvalidationLog {
    fn record(&mut self, ids: &[&EntityId]) {
        self.epoch += 1;
        self.recent
            .push_back((self.epoch, ids.iter().map(|id| (*id).clone()).collect()));
        if self.recent.len() > INVALIDATION_HISTORY {
            self.recent.pop_front();
        }
    }

    /// Whether any of `ids` may have been invalidated after `epoch`.
    fn touched_since(&self, epoch: u64, ids: &[EntityId]) -> bool {
        if epoch >= self.epoch {
            return false;
        }
        match self.recent.front() {
            // History no longer reaches back to `epoch`.
            Some((oldest, _)) if *oldest > epoch + 1 => return true,
            None => return true,
            _ => {}
        }
        self.recent
            .iter()
            .filter(|(e, _)| *e > epoch)
            .any(|(_, invalidated)| invalidated.iter().any(|id| ids.contains(id)))
    }
}

impl<V: Clone> CacheCoordinator<V> {
    pub fn new(configs: &TierConfigs, global_budget_bytes: usize) -> Self {
        let budget = Arc::new(MemoryBudget::new(global_budget_bytes));
        let tiers = TierKind::LOCK_ORDER.map(|kind| {
            let c = configs.get(kind);
            CacheTier::with_budget(
                kind,
                c.max_entries,
                c.ttl(),
                c.max_size_bytes(),
                budget.clone(),
            )
        });
        Self {
            tiers,
            budget,
            invalidations: Mutex::new(InvalidationLog::default()),
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(&config.tiers, config.global_memory_budget_bytes())
    }

    pub fn tier(&self, kind: TierKind) -> &CacheTier<V> {
        &self.tiers[kind.index()]
    }

    pub fn get(&self, kind: TierKind, key: &str) -> Option<V> {
        self.tier(kind).get(key)
    }

    /// Insert into `kind`, evicting within the tier and, if the global budget
    /// still does not hold, from other tiers by eviction priority.
    pub fn put(
        &self,
        kind: TierKind,
        key: impl Into<String>,
        value: V,
        size_bytes: usize,
        dependent_ids: Vec<EntityId>,
    ) -> PutOutcome {
        let tier = self.tier(kind);
        let spill = {
            let mut state = tier.lock();
            match tier.put_locked(&mut state, key.into(), value, size_bytes, dependent_ids) {
                Ok(outcome) => return outcome,
                Err(spill) => spill,
            }
        };

        // Slow path: the target lock was released above and every tier lock
        // is now taken in global order.
        let mut guards: Vec<_> = self.tiers.iter().map(CacheTier::lock).collect();
        let target = kind.index();

        guards[target].remove(&spill.key);
        let mut evicted = spill.evicted + tier.make_room(&mut guards[target], spill.size_bytes);

        while !self.budget.try_reserve(spill.size_bytes) {
            let victim = TierKind::EVICTION_ORDER
                .iter()
                .map(|k| k.index())
                .find(|&i| !guards[i].is_empty());
            let Some(i) = victim else {
                tracing::debug!(
                    tier = %kind,
                    size_bytes = spill.size_bytes,
                    budget = self.budget.limit(),
                    "Global cache budget cannot fit entry, bypassing"
                );
                return PutOutcome::OverBudget;
            };
            if let Some(entry) = guards[i].pop_lru() {
                self.tiers[i].record_eviction();
                evicted += 1;
                tracing::debug!(
                    from_tier = %self.tiers[i].kind(),
                    key = %entry.key,
                    "Global budget spill-over eviction"
                );
            }
        }

        tier.insert_reserved(&mut guards[target], spill);
        PutOutcome::Stored { evicted }
    }

    /// Current invalidation epoch. Capture it before reading from the
    /// backend and pass it to [`CacheCoordinator::put_since`].
    pub fn epoch(&self) -> u64 {
        self.invalidations.lock().epoch
    }

    /// [`CacheCoordinator::put`] for a value computed after `epoch` was
    /// captured. Returns [`PutOutcome::Stale`] without inserting if any of
    /// `dependent_ids` was invalidated since.
    pub fn put_since(
        &self,
        epoch: u64,
        kind: TierKind,
        key: impl Into<String>,
        value: V,
        size_bytes: usize,
        dependent_ids: Vec<EntityId>,
    ) -> PutOutcome {
        // Held across the insert: an invalidation either lands before the
        // check or removes the entry after it.
        let log = self.invalidations.lock();
        if log.touched_since(epoch, &dependent_ids) {
            return PutOutcome::Stale;
        }
        let outcome = self.put(kind, key, value, size_bytes, dependent_ids);
        drop(log);
        outcome
    }

    /// Remove every entry, in any tier, tagged with one of `ids`.
    pub fn invalidate<'a>(&self, ids: impl IntoIterator<Item = &'a EntityId>) -> usize {
        let ids: Vec<&EntityId> = ids.into_iter().collect();
        if ids.is_empty() {
            return 0;
        }
        self.invalidations.lock().record(&ids);

        let mut guards: Vec<_> = self.tiers.iter().map(CacheTier::lock).collect();
        let mut removed = 0;
        for (tier, guard) in self.tiers.iter().zip(guards.iter_mut()) {
            let n = guard.invalidate(&ids);
            tier.record_invalidations(n);
            removed += n;
        }
        drop(guards);

        tracing::debug!(ids = ids.len(), removed, "Cache invalidated");
        removed
    }

    /// TTL sweep across all tiers, one tier lock at a time.
    pub fn purge_expired(&self) -> usize {
        self.tiers.iter().map(CacheTier::purge_expired).sum()
    }

    pub fn clear(&self) {
        let mut guards: Vec<_> = self.tiers.iter().map(CacheTier::lock).collect();
        for guard in guards.iter_mut() {
            guard.clear();
        }
    }

    pub fn stats(&self) -> Vec<TierStats> {
        self.tiers.iter().map(CacheTier::stats).collect()
    }

    /// Bytes currently held across all tiers.
    pub fn memory_used(&self) -> usize {
        self.budget.used()
    }

    pub fn memory_budget(&self) -> usize {
        self.budget.limit()
    }
}
