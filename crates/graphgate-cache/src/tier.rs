//! A single LRU + TTL cache tier.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::time::Instant;

use graphgate_core::{EntityId, TierConfig, TierKind};

use crate::budget::MemoryBudget;

/// Result of a `put`. None of these are errors to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Inserted after evicting `evicted` least-recently-used entries.
    Stored { evicted: usize },
    /// The entry alone is larger than the tier (or global) byte budget; the
    /// cache was bypassed.
    Oversized,
    /// The global budget could not be satisfied even after spill-over eviction.
    OverBudget,
    /// A dependency was invalidated while the value was being computed.
    Stale,
}

impl PutOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Access order of an entry. Ordered by last access, then by insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Recency {
    accessed: u64,
    inserted: u64,
}

/// A cached value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub size_bytes: usize,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
    pub expires_at: Instant,
    /// Entities whose mutation invalidates this entry.
    pub dependent_ids: Vec<EntityId>,
    recency: Recency,
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Missing,
}

/// Lock-protected contents of a tier.
pub(crate) struct TierState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    lru: BTreeMap<Recency, String>,
    dependents: HashMap<EntityId, HashSet<String>>,
    size_bytes: usize,
    clock: u64,
    budget: Arc<MemoryBudget>,
}

impl<V: Clone> TierState<V> {
    fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            dependents: HashMap::new(),
            size_bytes: 0,
            clock: 0,
            budget,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, key: &str, now: Instant) -> Lookup<V> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Missing,
            Some(entry) => now >= entry.expires_at,
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }

        let tick = self.tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return Lookup::Missing;
        };
        let previous = entry.recency;
        entry.recency.accessed = tick;
        entry.last_accessed_at = now;
        let current = entry.recency;
        let value = entry.value.clone();

        self.lru.remove(&previous);
        self.lru.insert(current, key.to_string());
        Lookup::Hit(value)
    }

    /// Remove an entry and release its bytes. Not counted as an eviction.
    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.recency);
        for id in &entry.dependent_ids {
            if let Some(keys) = self.dependents.get_mut(id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(id);
                }
            }
        }
        self.size_bytes -= entry.size_bytes;
        self.budget.release(entry.size_bytes);
        Some(entry)
    }

    /// Remove the least-recently-used entry.
    pub(crate) fn pop_lru(&mut self) -> Option<CacheEntry<V>> {
        let key = self.lru.values().next()?.clone();
        self.remove(&key)
    }

    /// Insert an entry whose bytes are already reserved in the budget.
    fn insert_reserved(
        &mut self,
        key: String,
        value: V,
        size_bytes: usize,
        dependent_ids: Vec<EntityId>,
        ttl: Duration,
    ) {
        let now = Instant::now();
        let tick = self.tick();
        let recency = Recency {
            accessed: tick,
            inserted: tick,
        };

        for id in &dependent_ids {
            self.dependents
                .entry(id.clone())
                .or_default()
                .insert(key.clone());
        }
        self.lru.insert(recency, key.clone());
        self.size_bytes += size_bytes;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                size_bytes,
                inserted_at: now,
                last_accessed_at: now,
                expires_at: now + ttl,
                dependent_ids,
                recency,
            },
        );
    }

    /// Drop every entry tagged with any of `ids`.
    pub(crate) fn invalidate(&mut self, ids: &[&EntityId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(keys) = self.dependents.remove(*id) {
                for key in keys {
                    if self.remove(&key).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| now >= e.expires_at)
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.budget.release(self.size_bytes);
        self.entries.clear();
        self.lru.clear();
        self.dependents.clear();
        self.size_bytes = 0;
        count
    }
}

/// Value handed back to the coordinator when the global budget refused a
/// reservation and spill-over eviction is required.
pub(crate) struct Spill<V> {
    pub key: String,
    pub value: V,
    pub size_bytes: usize,
    pub dependent_ids: Vec<EntityId>,
    pub evicted: usize,
}

/// Point-in-time statistics of one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: TierKind,
    /// Number of live entries.
    pub size: usize,
    pub size_bytes: usize,
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub hit_rate_percent: f64,
}

/// Thread-safe LRU + TTL cache bounded by entry count and bytes.
///
/// Lookups past `expires_at` count as misses and drop the entry. When an
/// insert would break either bound, least-recently-accessed entries go first.
pub struct CacheTier<V> {
    kind: TierKind,
    max_entries: usize,
    ttl: Duration,
    max_size_bytes: usize,
    state: Mutex<TierState<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl<V: Clone> CacheTier<V> {
    /// A standalone tier with no global budget.
    pub fn new(kind: TierKind, config: &TierConfig) -> Self {
        Self::with_limits(kind, config.max_entries, config.ttl(), config.max_size_bytes())
    }

    pub fn with_limits(
        kind: TierKind,
        max_entries: usize,
        ttl: Duration,
        max_size_bytes: usize,
    ) -> Self {
        Self::with_budget(
            kind,
            max_entries,
            ttl,
            max_size_bytes,
            Arc::new(MemoryBudget::unbounded()),
        )
    }

    pub(crate) fn with_budget(
        kind: TierKind,
        max_entries: usize,
        ttl: Duration,
        max_size_bytes: usize,
        budget: Arc<MemoryBudget>,
    ) -> Self {
        Self {
            kind,
            max_entries,
            ttl,
            max_size_bytes,
            state: Mutex::new(TierState::new(budget)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let lookup = self.state.lock().lookup(key, now);
        match lookup {
            Lookup::Hit(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Lookup::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Missing => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace `key`.
    ///
    /// Budget-driven spill-over into other tiers only happens through
    /// [`crate::CacheCoordinator::put`]; here a refused global reservation
    /// yields [`PutOutcome::OverBudget`].
    pub fn put(
        &self,
        key: impl Into<String>,
        value: V,
        size_bytes: usize,
        dependent_ids: Vec<EntityId>,
    ) -> PutOutcome {
        let mut state = self.state.lock();
        match self.put_locked(&mut state, key.into(), value, size_bytes, dependent_ids) {
            Ok(outcome) => outcome,
            Err(_) => PutOutcome::OverBudget,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Drop every entry depending on any of `ids`.
    pub fn invalidate(&self, ids: &[EntityId]) -> usize {
        let refs: Vec<&EntityId> = ids.iter().collect();
        let removed = self.state.lock().invalidate(&refs);
        self.record_invalidations(removed);
        removed
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let purged = self.state.lock().purge_expired(Instant::now());
        if purged > 0 {
            self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
            tracing::debug!(tier = %self.kind, purged, "Expired cache entries purged");
        }
        purged
    }

    pub fn clear(&self) -> usize {
        self.state.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn stats(&self) -> TierStats {
        let (size, size_bytes) = {
            let state = self.state.lock();
            (state.len(), state.size_bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        TierStats {
            tier: self.kind,
            size,
            size_bytes,
            max_entries: self.max_entries,
            max_size_bytes: self.max_size_bytes,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate_percent: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
        }
    }

    // ── Coordinator hooks ────────────────────────────────────────

    pub(crate) fn lock(&self) -> MutexGuard<'_, TierState<V>> {
        self.state.lock()
    }

    /// Evict LRU entries until one more entry of `size_bytes` fits this tier.
    pub(crate) fn make_room(&self, state: &mut TierState<V>, size_bytes: usize) -> usize {
        let mut evicted = 0;
        while !state.is_empty()
            && (state.len() >= self.max_entries
                || state.size_bytes + size_bytes > self.max_size_bytes)
        {
            match state.pop_lru() {
                Some(entry) => {
                    self.record_eviction();
                    evicted += 1;
                    tracing::debug!(tier = %self.kind, key = %entry.key, "LRU eviction");
                }
                None => break,
            }
        }
        evicted
    }

    pub(crate) fn put_locked(
        &self,
        state: &mut TierState<V>,
        key: String,
        value: V,
        size_bytes: usize,
        dependent_ids: Vec<EntityId>,
    ) -> Result<PutOutcome, Spill<V>> {
        if size_bytes > self.max_size_bytes || size_bytes > state.budget.limit() {
            tracing::debug!(
                tier = %self.kind,
                size_bytes,
                max_size_bytes = self.max_size_bytes,
                "Oversized entry bypasses cache"
            );
            return Ok(PutOutcome::Oversized);
        }

        state.remove(&key);
        let evicted = self.make_room(state, size_bytes);

        if !state.budget.try_reserve(size_bytes) {
            return Err(Spill {
                key,
                value,
                size_bytes,
                dependent_ids,
                evicted,
            });
        }

        state.insert_reserved(key, value, size_bytes, dependent_ids, self.ttl);
        Ok(PutOutcome::Stored { evicted })
    }

    pub(crate) fn insert_reserved(&self, state: &mut TierState<V>, spill: Spill<V>) {
        state.insert_reserved(
            spill.key,
            spill.value,
            spill.size_bytes,
            spill.dependent_ids,
            self.ttl,
        );
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        if count > 0 {
            self.invalidations
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max_entries: usize) -> CacheTier<&'static str> {
        CacheTier::with_limits(TierKind::Node, max_entries, Duration::from_secs(60), 1024)
    }

    #[test]
    fn put_then_get_round_trips() {
        let t = tier(4);
        assert!(t.put("k", "v", 10, vec![]).is_stored());
        assert_eq!(t.get("k"), Some("v"));
        assert_eq!(t.stats().hits, 1);
    }

    #[test]
    fn third_insert_evicts_least_recently_used() {
        let t = tier(2);
        t.put("a", "A", 1, vec![]);
        t.put("b", "B", 1, vec![]);
        // Touch "a" so "b" becomes the LRU entry.
        assert_eq!(t.get("a"), Some("A"));

        let outcome = t.put("c", "C", 1, vec![]);
        assert_eq!(outcome, PutOutcome::Stored { evicted: 1 });
        assert_eq!(t.get("b"), None);
        assert_eq!(t.get("a"), Some("A"));
        assert_eq!(t.get("c"), Some("C"));
        assert_eq!(t.stats().evictions, 1);
    }

    #[test]
    fn byte_budget_evicts_until_fit() {
        let t = CacheTier::with_limits(TierKind::Search, 100, Duration::from_secs(60), 100);
        t.put("a", "A", 40, vec![]);
        t.put("b", "B", 40, vec![]);
        let outcome = t.put("c", "C", 50, vec![]);
        assert_eq!(outcome, PutOutcome::Stored { evicted: 1 });
        assert_eq!(t.size_bytes(), 90);
        assert_eq!(t.get("a"), None);
    }

    #[test]
    fn oversized_entry_is_bypassed() {
        let t = tier(4);
        t.put("small", "s", 10, vec![]);
        assert_eq!(t.put("huge", "h", 2048, vec![]), PutOutcome::Oversized);
        assert_eq!(t.get("huge"), None);
        // Nothing was evicted to make room for it.
        assert_eq!(t.get("small"), Some("s"));
    }

    #[test]
    fn replace_keeps_single_entry() {
        let t = tier(4);
        t.put("k", "v1", 10, vec![EntityId::from("1")]);
        t.put("k", "v2", 20, vec![EntityId::from("2")]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.size_bytes(), 20);
        // Old dependency tag was dropped with the old value.
        assert_eq!(t.invalidate(&[EntityId::from("1")]), 0);
        assert_eq!(t.invalidate(&[EntityId::from("2")]), 1);
    }

    #[test]
    fn invalidate_is_idempotent() {
        let t = tier(8);
        t.put("a", "A", 1, vec![EntityId::from("42")]);
        t.put("b", "B", 1, vec![EntityId::from("42"), EntityId::from("7")]);
        t.put("c", "C", 1, vec![EntityId::from("7")]);

        assert_eq!(t.invalidate(&[EntityId::from("42")]), 2);
        let after_once = (t.len(), t.size_bytes());
        assert_eq!(t.invalidate(&[EntityId::from("42")]), 0);
        assert_eq!((t.len(), t.size_bytes()), after_once);
        assert_eq!(t.get("c"), Some("C"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss() {
        let t = tier(4);
        t.put("k", "v", 1, vec![]);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(t.get("k"), Some("v"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(t.get("k"), None);

        let stats = t.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let t = CacheTier::with_limits(TierKind::Traversal, 8, Duration::from_secs(10), 1024);
        t.put("old", "o", 1, vec![]);
        tokio::time::advance(Duration::from_secs(6)).await;
        t.put("new", "n", 1, vec![]);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(t.purge_expired(), 1);
        assert_eq!(t.get("new"), Some("n"));
    }

    #[test]
    fn hit_rate_is_reported_in_percent() {
        let t = tier(4);
        t.put("k", "v", 1, vec![]);
        t.get("k");
        t.get("k");
        t.get("k");
        t.get("missing");
        assert!((t.stats().hit_rate_percent - 75.0).abs() < f64::EPSILON);
    }
}
