//! The provider capability set (§4.4.2, §9 "deep inheritance / mixin
//! pattern in source").
//!
//! A provider is the thing [`crate::manager::KVHeavyTasksManager`] drives:
//! constructed with a key and (maybe) resume data, started non-blocking,
//! and stoppable on preemption. Rather than a base class with overridable
//! hooks, the capability set is a single trait with two injected sink
//! closures; `StopAction` replaces the sentinel-valued "should I keep this
//! instance around" return the original relied on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// What the manager should do with a provider instance after `stop()`
/// returns (§4.4.2, §4.4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Keep the instance; a later `start()` resumes it in place.
    Reuse,
    /// Drop the instance. If it carries non-empty resume data, the manager
    /// persists that to the resume cache first.
    Dealloc,
}

/// Fan-out sink for progress events; every registered `event` observer for
/// a key receives every event a provider publishes, in arrival order
/// (§4.4.5).
pub type EventSink<P> = Arc<dyn Fn(P) + Send + Sync>;

/// The sink a provider calls exactly once to report its outcome. Delivering
/// more than once is tolerated by the manager (later calls are discarded,
/// §7 kind 4) but a well-behaved provider never relies on that.
pub type ResultSink<V, E> = Arc<dyn Fn(Result<Option<V>, E>) + Send + Sync>;

/// Capability set a long-running, interruptible data provider must expose
/// (§4.4.2, §6).
///
/// `start()` must be non-blocking: it kicks off work (typically
/// `tokio::spawn`) and returns immediately. The provider emits progress via
/// its `event_sink` and terminates by calling `result_sink` exactly once,
/// unless preempted first.
pub trait Provider: Send + 'static {
    /// The key addressing this provider's unit of work.
    type Key: Clone + Eq + std::hash::Hash + Send + Sync + 'static;
    /// The value it ultimately produces.
    type Value: Clone + Send + Sync + 'static;
    /// The opaque progress payload it streams while running.
    type Progress: Clone + Send + Sync + 'static;
    /// The error it can fail with.
    type Error: Clone + Send + Sync + 'static;

    /// Builds a fresh instance for `key`. `resume_data`, if present, came
    /// either from a retained (`Reuse`) instance being restarted, or from
    /// the resume cache (§4.4.5).
    fn construct(
        key: Self::Key,
        resume_data: Option<Vec<u8>>,
        event_sink: EventSink<Self::Progress>,
        result_sink: ResultSink<Self::Value, Self::Error>,
    ) -> Self;

    /// Starts (or resumes) doing work. Must return without blocking.
    fn start(&mut self);

    /// Synchronously transitions `running -> paused` (a no-op if the
    /// provider was not running), and reports whether the manager should
    /// retain (`Reuse`) or drop (`Dealloc`) this instance.
    fn stop(&mut self) -> StopAction;

    /// Opaque resume state surrendered on `Dealloc`. `None` or an empty
    /// buffer means there is nothing worth persisting.
    fn resume_data(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A reusable cancellation signal for providers whose background work needs
/// to notice a `stop()` call (§5 "implemented with a per-provider
/// `CancellationToken` that `stop()` triggers"). Not required by
/// [`Provider`] — a provider may manage its own shutdown signal however it
/// likes — but `stop()` must stay synchronous and idempotent, which
/// `CancellationToken::cancel()` already is, so most providers are better
/// off just holding one of these.
#[derive(Debug, Clone, Default)]
pub struct CancelGuard(CancellationToken);

impl CancelGuard {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Signals cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once `cancel()` has been called. A provider's background
    /// task typically races this against its real work with
    /// `tokio::select!` so it can stop promptly on preemption.
    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

/// Wraps a sink so only the first invocation is delivered; every later call
/// is silently discarded (§4.4.6 step 1, §7 kind 4, §9 `safe_publish`).
pub(crate) fn guard_once<T, F>(f: F) -> Arc<dyn Fn(T) + Send + Sync>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let fired = Arc::new(AtomicBool::new(false));
    Arc::new(move |value: T| {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        f(value);
    })
}
