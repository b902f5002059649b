//! One conforming implementation of the memory-cache contract (§1, §6)
//! used for both the result cache and the resume-data cache (§4.4.1).
//!
//! The contract distinguishes four outcomes on lookup — `Miss`,
//! `HitValue`, `HitNull`, `InvalidKey` — because a provider may legitimately
//! produce "no value" (DESIGN.md open question (c)), and a key validator
//! can reject a lookup before it ever reaches a provider (§4.4.8). Capacity
//! eviction order is deliberately unspecified territory (§1); this
//! implementation tracks insertion order with [`crate::keyqueue::KeyQueue`]
//! and evicts oldest-first, the same FIFO discipline the manager itself
//! uses for its waiting queue.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::CacheConfig;
use crate::keyqueue::{EvictionPolicy, KeyQueue};

/// Outcome of a cache lookup (§6 "Result cache contract").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheHit<V> {
    /// No entry for this key.
    Miss,
    /// A non-expired entry holding a value.
    HitValue(V),
    /// A non-expired entry explicitly caching "no value".
    HitNull,
    /// The key validator rejected this key; no provider is ever invoked for
    /// it (§4.4.8).
    InvalidKey,
}

impl<V> CacheHit<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheHit::HitValue(_) | CacheHit::HitNull)
    }
}

/// Coarse shape of a [`CacheHit`], carried alongside a key in a
/// [`CacheRecord`] so a statistics sink does not need to clone `V` just to
/// see what kind of hit occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    HitValue,
    HitNull,
    InvalidKey,
}

/// One cache operation, reported to an optional sink alongside the
/// statistics snapshot taken immediately after it (§4.4.1
/// `cache_statistics_report`).
#[derive(Debug, Clone)]
pub enum CacheRecord<K> {
    Get { key: K, outcome: CacheOutcome },
    Set { key: K, is_null: bool },
    Evicted { key: K },
    Cleared,
}

/// Monotonically non-decreasing counters for the life of a cache instance
/// (Data Model §3 "CacheStatistics").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub hit_nulls: u64,
    pub invalid_keys: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub current_size: usize,
}

struct Entry<V> {
    value: Option<V>,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

type KeyValidator<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;
type StatisticsSink<K> = Arc<dyn Fn(&CacheStatistics, &CacheRecord<K>) + Send + Sync>;

/// The shipped implementation of the memory-cache contract (§1, §6).
///
/// Safe to share via `Arc` across the manager's callers; every operation is
/// internally synchronized.
pub struct InMemoryCache<K, V> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, Entry<V>>>,
    order: Mutex<KeyQueue<K>>,
    validator: Option<KeyValidator<K>>,
    stats: Mutex<CacheStatistics>,
    report: Option<StatisticsSink<K>>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.max_entries;
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(KeyQueue::new(capacity)),
            validator: None,
            stats: Mutex::new(CacheStatistics::default()),
            report: None,
        }
    }

    /// Installs a key validator applied at both `get` and `set` (§6). Keys
    /// it rejects never touch the backing map and are reported as
    /// `InvalidKey`.
    pub fn with_key_validator(mut self, validator: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Installs a sink receiving `(CacheStatistics, CacheRecord)` after
    /// every operation (§4.4.1).
    pub fn with_statistics_sink(
        mut self,
        sink: impl Fn(&CacheStatistics, &CacheRecord<K>) + Send + Sync + 'static,
    ) -> Self {
        self.report = Some(Arc::new(sink));
        self
    }

    pub fn statistics(&self) -> CacheStatistics {
        *self.stats.lock().unwrap()
    }

    fn report(&self, record: CacheRecord<K>) {
        if let Some(sink) = &self.report {
            let snapshot = *self.stats.lock().unwrap();
            sink(&snapshot, &record);
        }
    }

    /// Looks up `key`, returning one of the four outcomes the contract
    /// distinguishes (§6).
    pub fn get(&self, key: &K) -> CacheHit<V> {
        if let Some(validator) = &self.validator {
            if !validator(key) {
                self.stats.lock().unwrap().invalid_keys += 1;
                let record = CacheRecord::Get {
                    key: key.clone(),
                    outcome: CacheOutcome::InvalidKey,
                };
                self.report(record);
                return CacheHit::InvalidKey;
            }
        }

        let mut entries = self.entries.lock().unwrap();
        let expired = matches!(entries.get(key), Some(e) if e.is_expired());
        if expired {
            entries.remove(key);
            self.order.lock().unwrap().remove(key);
        }

        let outcome = match entries.get(key) {
            None => {
                self.stats.lock().unwrap().misses += 1;
                CacheHit::Miss
            }
            Some(entry) => match &entry.value {
                Some(v) => {
                    self.stats.lock().unwrap().hits += 1;
                    CacheHit::HitValue(v.clone())
                }
                None => {
                    self.stats.lock().unwrap().hit_nulls += 1;
                    CacheHit::HitNull
                }
            },
        };
        drop(entries);

        let kind = match &outcome {
            CacheHit::Miss => CacheOutcome::Miss,
            CacheHit::HitValue(_) => CacheOutcome::HitValue,
            CacheHit::HitNull => CacheOutcome::HitNull,
            CacheHit::InvalidKey => CacheOutcome::InvalidKey,
        };
        debug!(?kind, "cache lookup");
        self.report(CacheRecord::Get {
            key: key.clone(),
            outcome: kind,
        });
        outcome
    }

    /// Stores `value` (`None` caches an explicit null result) under `key`.
    /// A key the validator rejects is silently dropped — it never enters
    /// the cache, matching the rule that invalid keys never reach a
    /// provider either (§4.4.8).
    pub fn set(&self, key: K, value: Option<V>, ttl: Option<Duration>) {
        if let Some(validator) = &self.validator {
            if !validator(&key) {
                return;
            }
        }

        let expires_at = ttl.or(self.config.default_ttl).map(|d| Instant::now() + d);
        let is_null = value.is_none();

        {
            let mut entries = self.entries.lock().unwrap();
            let mut order = self.order.lock().unwrap();

            if let Some(evicted) = order.enqueue_front(key.clone(), EvictionPolicy::Fifo) {
                if evicted != key {
                    entries.remove(&evicted);
                    self.stats.lock().unwrap().evictions += 1;
                    self.report(CacheRecord::Evicted { key: evicted });
                }
            }

            entries.insert(key.clone(), Entry { value, expires_at });
            let mut stats = self.stats.lock().unwrap();
            stats.inserts += 1;
            stats.current_size = entries.len();
        }

        debug!(is_null, "cache set");
        self.report(CacheRecord::Set { key, is_null });
    }

    /// Drops every entry. Statistics counters are not reset (they are
    /// monotonic for the life of the instance).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        let capacity = self.order.lock().unwrap().capacity();
        *self.order.lock().unwrap() = KeyQueue::new(capacity);
        self.stats.lock().unwrap().current_size = 0;
        drop(entries);
        self.report(CacheRecord::Cleared);
    }

    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.lock().unwrap();
        matches!(entries.get(key), Some(e) if !e.is_expired())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            default_ttl: None,
        }
    }

    #[test]
    fn miss_then_hit_value() {
        let cache: InMemoryCache<String, u32> = InMemoryCache::new(config(10));
        assert_eq!(cache.get(&"k".to_string()), CacheHit::Miss);
        cache.set("k".to_string(), Some(42), None);
        assert_eq!(cache.get(&"k".to_string()), CacheHit::HitValue(42));
    }

    #[test]
    fn hit_null_is_distinct_from_miss() {
        let cache: InMemoryCache<String, u32> = InMemoryCache::new(config(10));
        cache.set("k".to_string(), None, None);
        assert_eq!(cache.get(&"k".to_string()), CacheHit::HitNull);
        assert_ne!(cache.get(&"missing".to_string()), CacheHit::HitNull);
    }

    #[test]
    fn invalid_key_bypasses_storage_entirely() {
        let cache: InMemoryCache<String, u32> =
            InMemoryCache::new(config(10)).with_key_validator(|k: &String| k.starts_with("ok-"));
        assert_eq!(cache.get(&"bad".to_string()), CacheHit::InvalidKey);
        cache.set("bad".to_string(), Some(1), None);
        assert_eq!(cache.get(&"bad".to_string()), CacheHit::InvalidKey);
        assert!(!cache.contains(&"bad".to_string()));

        cache.set("ok-1".to_string(), Some(7), None);
        assert_eq!(cache.get(&"ok-1".to_string()), CacheHit::HitValue(7));
    }

    #[test]
    fn ttl_expiry_produces_a_miss() {
        let cache: InMemoryCache<String, u32> = InMemoryCache::new(config(10));
        cache.set("k".to_string(), Some(1), Some(Duration::from_millis(10)));
        assert_eq!(cache.get(&"k".to_string()), CacheHit::HitValue(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"k".to_string()), CacheHit::Miss);
    }

    #[test]
    fn capacity_eviction_drops_oldest_insertion() {
        let cache: InMemoryCache<&str, u32> = InMemoryCache::new(config(2));
        cache.set("a", Some(1), None);
        cache.set("b", Some(2), None);
        cache.set("c", Some(3), None);

        assert_eq!(cache.get(&"a"), CacheHit::Miss);
        assert_eq!(cache.get(&"b"), CacheHit::HitValue(2));
        assert_eq!(cache.get(&"c"), CacheHit::HitValue(3));
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn statistics_counters_are_accurate() {
        let cache: InMemoryCache<&str, u32> = InMemoryCache::new(config(10));
        cache.set("a", Some(1), None);
        cache.get(&"a"); // hit
        cache.get(&"missing"); // miss
        cache.set("b", None, None);
        cache.get(&"b"); // hit-null

        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_nulls, 1);
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.current_size, 2);
    }

    #[test]
    fn statistics_sink_receives_every_operation() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let cache: InMemoryCache<&str, u32> = InMemoryCache::new(config(10))
            .with_statistics_sink(move |_stats, _record| {
                count2.fetch_add(1, Ordering::SeqCst);
            });

        cache.set("a", Some(1), None);
        cache.get(&"a");
        cache.get(&"missing");

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clear_drops_entries_but_not_counters() {
        let cache: InMemoryCache<&str, u32> = InMemoryCache::new(config(10));
        cache.set("a", Some(1), None);
        cache.clear();
        assert_eq!(cache.get(&"a"), CacheHit::Miss);
        assert!(cache.statistics().inserts >= 1);
    }
}
