//! Configuration types for the cache contract and the heavy-task manager.
//!
//! This crate reads no files and no environment variables (§6): a host
//! application builds these structs however it likes — parsed from its own
//! TOML/YAML/env layer, or just hand-assembled in tests — and hands them to
//! [`crate::manager::KVHeavyTasksManager::new`] or
//! [`crate::cache::InMemoryCache::new`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Priority strategy selecting which waiting key runs next, and how
/// contention on a full running set is resolved (§4.4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityStrategy {
    /// Oldest arrival runs first; the running set is never preempted.
    Fifo,
    /// Newest arrival runs first.
    Lifo(InterruptMode),
}

/// How a LIFO manager behaves when the running set is full and a new key
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptMode {
    /// The new key waits behind the currently running keys.
    Await,
    /// The earliest-started running key is preempted (`stop()`) to make
    /// room for the new key.
    Stop,
}

impl Default for PriorityStrategy {
    fn default() -> Self {
        PriorityStrategy::Fifo
    }
}

/// Top-level configuration for a [`crate::manager::KVHeavyTasksManager`]
/// (§4.4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on concurrent providers in the running phase.
    pub max_running: usize,
    /// Upper bound on keys in the waiting queue.
    pub max_queueing: usize,
    /// FIFO or LIFO(await|stop) admission policy.
    pub priority_strategy: PriorityStrategy,
    /// Result cache configuration.
    pub result_cache: CacheConfig,
    /// Resume-data cache configuration.
    pub resume_cache: CacheConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_running: 4,
            max_queueing: 64,
            priority_strategy: PriorityStrategy::Fifo,
            result_cache: CacheConfig::default(),
            resume_cache: CacheConfig {
                default_ttl: Some(Duration::from_secs(3600)),
                ..CacheConfig::default()
            },
        }
    }
}

/// Configuration for one [`crate::cache::InMemoryCache`] instance (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries retained; the oldest-inserted entry is
    /// evicted once this bound would be exceeded.
    pub max_entries: usize,
    /// Default TTL applied when a `set` call does not specify one.
    /// `None` means entries never expire on their own.
    #[serde(with = "duration_opt_secs")]
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

mod duration_opt_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
