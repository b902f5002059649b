//! Client-side concurrent task coordinator: single-flight caching
//! ([`mono_task`]), a capacity-bounded ordered set ([`keyqueue`]), and a
//! keyed scheduler over long-running, interruptible data providers
//! ([`manager`]).
//!
//! These three subsystems compose: [`manager::KVHeavyTasksManager`] uses
//! [`keyqueue::KeyQueue`] as its waiting structure and [`cache::InMemoryCache`]
//! for its result/resume caches. [`mono_task::MonoTask`] is independent of
//! the manager — it is the single-key building block a caller reaches for
//! when they only need de-duplication and TTL caching around one value,
//! without the manager's running/waiting capacity machinery.

pub mod cache;
pub mod config;
pub mod error;
pub mod keyqueue;
pub mod logging;
pub mod manager;
pub mod mono_task;
pub mod provider;
pub mod retry;

pub use cache::{CacheHit, CacheOutcome, CacheRecord, CacheStatistics, InMemoryCache};
pub use config::{CacheConfig, InterruptMode, ManagerConfig, PriorityStrategy};
pub use error::{CoordinatorError, FetchResult};
pub use keyqueue::{EvictionPolicy, KeyQueue};
pub use manager::KVHeavyTasksManager;
pub use mono_task::{BoxFuture, Completion, MonoTask, Runner, TokioRunner};
pub use provider::{CancelGuard, EventSink, Provider, ResultSink, StopAction};
pub use retry::{IntervalStrategy, RetrySchedule};
