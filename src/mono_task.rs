//! Single-flight, TTL-cached, retrying executor (§4.3).
//!
//! `MonoTask<T, E>` coalesces concurrent callers into one underlying
//! attempt, caches a successful result until it expires, retries a failed
//! attempt according to a [`RetrySchedule`], and supports a forced refresh
//! that discards whatever is in flight and starts over while keeping every
//! waiter attached.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::retry::RetrySchedule;

/// A future ready to be handed to a [`Runner`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Dispatches work; lets a caller substitute something other than the
/// ambient `tokio` runtime for attempts or callback delivery (§4.3 "queue
/// selection").
pub trait Runner: Send + Sync {
    fn spawn(&self, fut: BoxFuture);
}

/// The default runner: spawns onto the ambient `tokio` runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

impl Runner for TokioRunner {
    fn spawn(&self, fut: BoxFuture) {
        tokio::spawn(fut);
    }
}

/// The one-shot completion a task `body` must invoke exactly once per
/// attempt. A second invocation is silently discarded (§4.3 step 2,
/// `safe_callback`).
pub type Completion<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

type Body<T, E> = Arc<dyn Fn(Completion<T, E>) + Send + Sync>;
type Waiter<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

struct Inner<T, E> {
    cached: Option<(T, Instant)>,
    generation: u64,
    executing: bool,
    waiters: Vec<Waiter<T, E>>,
}

/// Single-slot executor with TTL caching, retry, and forced refresh
/// (§4.3).
pub struct MonoTask<T, E> {
    state: Arc<Mutex<Inner<T, E>>>,
    retry: RetrySchedule,
    ttl: Duration,
    task_runner: Arc<dyn Runner>,
    callback_runner: Option<Arc<dyn Runner>>,
    body: Body<T, E>,
}

impl<T, E> MonoTask<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Builds a task around `body`. `body` must invoke its `Completion`
    /// argument exactly once per call; `task_runner` dispatches attempts
    /// (defaults to `tokio::spawn`); `callback_runner`, if set, delivers
    /// every waiter callback there instead of on whichever runner produced
    /// the completion.
    pub fn new(
        retry: RetrySchedule,
        ttl: Duration,
        task_runner: Option<Arc<dyn Runner>>,
        callback_runner: Option<Arc<dyn Runner>>,
        body: impl Fn(Completion<T, E>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(Inner {
                cached: None,
                generation: 0,
                executing: false,
                waiters: Vec::new(),
            })),
            retry,
            ttl,
            task_runner: task_runner.unwrap_or_else(|| Arc::new(TokioRunner)),
            callback_runner,
            body: Arc::new(body),
        }
    }

    /// `Some(value)` iff a non-expired cached value exists.
    pub fn current_result(&self) -> Option<T> {
        let guard = self.state.lock().unwrap();
        match &guard.cached {
            Some((value, expiry)) if Instant::now() < *expiry => Some(value.clone()),
            _ => None,
        }
    }

    /// True while at least one attempt is in flight.
    pub fn is_executing(&self) -> bool {
        self.state.lock().unwrap().executing
    }

    /// Registers `cb` for the current (or a freshly started) attempt.
    ///
    /// - `force_update = false` and a non-expired cached value exists: `cb`
    ///   is delivered asynchronously with that value, no attempt is
    ///   started.
    /// - `force_update = false`, no cached value, an attempt already in
    ///   flight: `cb` is attached as a waiter on that attempt.
    /// - `force_update = false`, no cached value, nothing in flight: a new
    ///   attempt starts and `cb` is attached to it.
    /// - `force_update = true`: a fresh attempt always starts, taking over
    ///   every already-registered waiter plus `cb`; any result from the
    ///   attempt this replaces is discarded when it eventually arrives.
    pub fn execute(&self, force_update: bool, cb: impl FnOnce(Result<T, E>) + Send + 'static) {
        let mut guard = self.state.lock().unwrap();

        if !force_update {
            if let Some((value, expiry)) = &guard.cached {
                if Instant::now() < *expiry {
                    let value = value.clone();
                    drop(guard);
                    self.deliver_one(cb, Ok(value));
                    return;
                }
            }
        }

        guard.waiters.push(Box::new(cb));

        if force_update {
            guard.generation += 1;
            guard.executing = true;
            let generation = guard.generation;
            drop(guard);
            self.spawn_attempt(generation);
            return;
        }

        if guard.executing {
            return;
        }

        guard.executing = true;
        let generation = guard.generation;
        drop(guard);
        self.spawn_attempt(generation);
    }

    /// `async fn` wrapper around [`Self::execute`] built on a one-shot
    /// channel (§9 "coroutine/suspension constructs").
    pub async fn async_execute(&self, force_update: bool) -> Result<T, E> {
        let (tx, rx) = oneshot::channel();
        self.execute(force_update, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .expect("MonoTask attempt dropped its waiter without delivering a result")
    }

    fn deliver_one(&self, cb: impl FnOnce(Result<T, E>) + Send + 'static, result: Result<T, E>) {
        let runner = self.callback_runner.as_ref().unwrap_or(&self.task_runner);
        runner.spawn(Box::pin(async move { cb(result) }));
    }

    fn spawn_attempt(&self, generation: u64) {
        let state = Arc::clone(&self.state);
        let body = Arc::clone(&self.body);
        let ttl = self.ttl;
        let mut retry = self.retry;
        let this_task_runner = Arc::clone(&self.task_runner);
        let this_callback_runner = self.callback_runner.clone();

        let fut: BoxFuture = Box::pin(async move {
            loop {
                let (tx, rx) = oneshot::channel::<Result<T, E>>();
                let fired = Arc::new(AtomicBool::new(false));
                let tx_slot = Mutex::new(Some(tx));

                let completion: Completion<T, E> = {
                    let fired = Arc::clone(&fired);
                    Box::new(move |result| {
                        if fired.swap(true, Ordering::SeqCst) {
                            // Duplicate completion from the body; discarded
                            // (§4.3 `safe_callback`, §7 kind 5).
                            return;
                        }
                        if let Some(tx) = tx_slot.lock().unwrap().take() {
                            let _ = tx.send(result);
                        }
                    })
                };

                (body)(completion);

                let outcome = match rx.await {
                    Ok(outcome) => outcome,
                    // The body dropped its completion without ever calling
                    // it; treat the attempt as abandoned.
                    Err(_) => return,
                };

                match outcome {
                    Ok(value) => {
                        let waiters = {
                            let mut guard = state.lock().unwrap();
                            if guard.generation != generation {
                                return; // superseded by a forced refresh
                            }
                            guard.cached = Some((value.clone(), Instant::now() + ttl));
                            guard.executing = false;
                            std::mem::take(&mut guard.waiters)
                        };
                        let runner = this_callback_runner.as_ref().unwrap_or(&this_task_runner);
                        for waiter in waiters {
                            let value = value.clone();
                            runner.spawn(Box::pin(async move { waiter(Ok(value)) }));
                        }
                        return;
                    }
                    Err(err) => match retry.interval() {
                        None => {
                            let waiters = {
                                let mut guard = state.lock().unwrap();
                                if guard.generation != generation {
                                    return;
                                }
                                guard.executing = false;
                                std::mem::take(&mut guard.waiters)
                            };
                            let runner =
                                this_callback_runner.as_ref().unwrap_or(&this_task_runner);
                            for waiter in waiters {
                                let err = err.clone();
                                runner.spawn(Box::pin(async move { waiter(Err(err)) }));
                            }
                            return;
                        }
                        Some(delay) => {
                            {
                                // Stop retrying a superseded attempt rather
                                // than sleeping pointlessly.
                                let guard = state.lock().unwrap();
                                if guard.generation != generation {
                                    return;
                                }
                            }
                            tokio::time::sleep(delay).await;
                            retry = retry.next();
                            continue;
                        }
                    },
                }
            }
        });

        self.task_runner.spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn immediate_ok(value: &'static str) -> impl Fn(Completion<String, String>) + Send + Sync {
        move |cb| cb(Ok(value.to_string()))
    }

    #[tokio::test]
    async fn coalesces_concurrent_callers_into_one_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let task: Arc<MonoTask<String, String>> = Arc::new(MonoTask::new(
            RetrySchedule::never(),
            Duration::from_secs(60),
            None,
            None,
            move |cb| {
                calls2.fetch_add(1, Ordering::SeqCst);
                cb(Ok("value".to_string()));
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let task = Arc::clone(&task);
            handles.push(tokio::spawn(
                async move { task.async_execute(false).await.unwrap() },
            ));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caches_result_until_ttl_expires() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let task = MonoTask::new(
            RetrySchedule::never(),
            Duration::from_millis(50),
            None,
            None,
            move |cb| {
                calls2.fetch_add(1, Ordering::SeqCst);
                cb(Ok("v".to_string()));
            },
        );

        assert_eq!(task.async_execute(false).await.unwrap(), "v");
        assert_eq!(task.async_execute(false).await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.current_result(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(task.current_result(), None);
        assert_eq!(task.async_execute(false).await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_until_schedule_is_terminal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = Arc::clone(&attempts);
        let task = MonoTask::new(
            RetrySchedule::from(2),
            Duration::from_secs(60),
            None,
            None,
            move |cb| {
                attempts2.fetch_add(1, Ordering::SeqCst);
                cb(Err("boom".to_string()));
            },
        );

        let result = task.async_execute(false).await;
        assert_eq!(result, Err("boom".to_string()));
        // one initial attempt + two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn forced_refresh_replaces_in_flight_attempt() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = Arc::clone(&gate);
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt2 = Arc::clone(&attempt);

        let task: Arc<MonoTask<u32, String>> = Arc::new(MonoTask::new(
            RetrySchedule::never(),
            Duration::from_secs(60),
            None,
            None,
            move |cb| {
                let n = attempt2.fetch_add(1, Ordering::SeqCst) + 1;
                let gate = Arc::clone(&gate2);
                tokio::spawn(async move {
                    if n == 1 {
                        gate.notified().await;
                    }
                    cb(Ok(n));
                });
            },
        ));

        let first = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.async_execute(false).await })
        };
        tokio::task::yield_now().await;

        let second = task.async_execute(true).await.unwrap();
        assert_eq!(second, 2);

        gate.notify_one();
        let first = first.await.unwrap();
        // first attempt's completion is discarded (stale generation); the
        // waiter registered on attempt 1 was redirected to attempt 2.
        assert_eq!(first, Ok(2));
    }

    #[tokio::test]
    async fn duplicate_completion_from_body_is_discarded() {
        let task = MonoTask::new(
            RetrySchedule::never(),
            Duration::from_secs(60),
            None,
            None,
            immediate_ok("only-once"),
        );
        assert_eq!(task.async_execute(false).await.unwrap(), "only-once");
    }

    #[tokio::test]
    async fn forced_refresh_failure_preserves_prior_cached_value() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt2 = Arc::clone(&attempt);
        let task = MonoTask::new(
            RetrySchedule::never(),
            Duration::from_secs(60),
            None,
            None,
            move |cb| {
                let n = attempt2.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    cb(Ok("ok_1".to_string()));
                } else {
                    cb(Err("boom".to_string()));
                }
            },
        );

        assert_eq!(task.async_execute(false).await.unwrap(), "ok_1");
        assert_eq!(task.current_result(), Some("ok_1".to_string()));

        let refresh = task.async_execute(true).await;
        assert_eq!(refresh, Err("boom".to_string()));

        // the failed forced refresh never touched the cache from attempt 1.
        assert_eq!(task.current_result(), Some("ok_1".to_string()));
        assert_eq!(task.async_execute(false).await.unwrap(), "ok_1");
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }
}
