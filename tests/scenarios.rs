//! End-to-end scenario tests against the public API, one per literal
//! example in spec §8. Unit tests colocated with `src/manager.rs`,
//! `src/mono_task.rs`, and `src/keyqueue.rs` cover the same invariants at
//! finer grain; these exercise the crate the way a downstream caller would,
//! importing only what `kv_heavy_tasks::` re-exports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use kv_heavy_tasks::{
    CoordinatorError, EventSink, InterruptMode, ManagerConfig, Provider, PriorityStrategy,
    ResultSink, StopAction, KVHeavyTasksManager,
};

/// A provider whose unit of work is "count up to `total`, pausing once at
/// `pause_at` until released", with a resumable `progress` cursor shared
/// across `stop()`/`start()` cycles via `Arc`. Good enough to model both the
/// trivial providers (scenarios 1, 3, 4) and the resumable one (scenario 2)
/// by varying `pause_at`/`total`.
struct CountingProvider {
    key: String,
    event_sink: EventSink<(u32, u32)>,
    result_sink: ResultSink<String, String>,
    progress: Arc<AtomicUsize>,
    gate: Arc<Mutex<Arc<Notify>>>,
    total: u32,
    pause_at: Option<u32>,
    stop_action: StopAction,
}

#[derive(Clone)]
struct CountingConfig {
    progress: Arc<AtomicUsize>,
    gate: Arc<Mutex<Arc<Notify>>>,
    total: u32,
    pause_at: Option<u32>,
    stop_action: StopAction,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            progress: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Mutex::new(Arc::new(Notify::new()))),
            total: 3,
            pause_at: None,
            stop_action: StopAction::Dealloc,
        }
    }
}

thread_local! {
    static NEXT: Mutex<Option<CountingConfig>> = Mutex::new(None);
}

fn set_next(cfg: CountingConfig) {
    NEXT.with(|c| *c.lock().unwrap() = Some(cfg));
}

impl Provider for CountingProvider {
    type Key = String;
    type Value = String;
    type Progress = (u32, u32);
    type Error = String;

    fn construct(
        key: Self::Key,
        _resume_data: Option<Vec<u8>>,
        event_sink: EventSink<Self::Progress>,
        result_sink: ResultSink<Self::Value, Self::Error>,
    ) -> Self {
        let cfg = NEXT.with(|c| c.lock().unwrap().clone()).unwrap_or_default();
        Self {
            key,
            event_sink,
            result_sink,
            progress: cfg.progress,
            gate: cfg.gate,
            total: cfg.total,
            pause_at: cfg.pause_at,
            stop_action: cfg.stop_action,
        }
    }

    fn start(&mut self) {
        let key = self.key.clone();
        let event_sink = Arc::clone(&self.event_sink);
        let result_sink = Arc::clone(&self.result_sink);
        let progress = Arc::clone(&self.progress);
        let gate = Arc::clone(&self.gate);
        let total = self.total;
        let pause_at = self.pause_at;

        tokio::spawn(async move {
            loop {
                let next = progress.load(Ordering::SeqCst) as u32 + 1;
                if next > total {
                    break;
                }
                progress.store(next as usize, Ordering::SeqCst);
                event_sink((next, total));
                if pause_at == Some(next) {
                    let g = gate.lock().unwrap().clone();
                    g.notified().await;
                }
            }
            result_sink(Ok(Some(key)));
        });
    }

    fn stop(&mut self) -> StopAction {
        // A fresh gate so a task still parked on the old one from a prior
        // `start()` call is never spuriously woken by a later `notify_one`.
        *self.gate.lock().unwrap() = Arc::new(Notify::new());
        self.stop_action
    }

    fn resume_data(&self) -> Option<Vec<u8>> {
        None
    }
}

fn config(max_running: usize, max_queueing: usize, strategy: PriorityStrategy) -> ManagerConfig {
    ManagerConfig {
        max_running,
        max_queueing,
        priority_strategy: strategy,
        ..ManagerConfig::default()
    }
}

/// Scenario 1: cache hit after miss.
#[tokio::test]
async fn scenario_1_cache_hit_after_miss() {
    set_next(CountingConfig {
        total: 3,
        ..Default::default()
    });
    let manager: KVHeavyTasksManager<CountingProvider> =
        KVHeavyTasksManager::new(config(1, 8, PriorityStrategy::Fifo));

    let events = Arc::new(Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);
    let (tx, rx) = oneshot::channel();
    manager.fetch(
        "abc".to_string(),
        Some(Arc::new(move |p: (u32, u32)| events2.lock().unwrap().push(p))),
        move |outcome| {
            let _ = tx.send(outcome);
        },
    );
    assert_eq!(rx.await.unwrap(), Ok(Some("abc".to_string())));
    assert_eq!(*events.lock().unwrap().last().unwrap(), (3, 3));
    assert!(!events.lock().unwrap().is_empty());

    let events_second = Arc::new(Mutex::new(Vec::new()));
    let events_second2 = Arc::clone(&events_second);
    let (tx2, rx2) = oneshot::channel();
    let before = tokio::time::Instant::now();
    manager.fetch(
        "abc".to_string(),
        Some(Arc::new(move |p: (u32, u32)| {
            events_second2.lock().unwrap().push(p)
        })),
        move |outcome| {
            let _ = tx2.send(outcome);
        },
    );
    let outcome = tokio::time::timeout(Duration::from_millis(100), rx2)
        .await
        .expect("cache hit must be delivered within 100ms")
        .unwrap();
    assert_eq!(outcome, Ok(Some("abc".to_string())));
    assert!(before.elapsed() < Duration::from_millis(100));
    assert!(events_second.lock().unwrap().is_empty());
}

/// Scenario 2: LIFO(Stop) preempts a running key, then resumes it without
/// restarting its progress from zero once the preempting key finishes.
#[tokio::test]
async fn scenario_2_lifo_stop_resumes_without_restarting_progress() {
    let long_progress = Arc::new(AtomicUsize::new(0));
    set_next(CountingConfig {
        progress: Arc::clone(&long_progress),
        total: 7,
        pause_at: Some(2),
        stop_action: StopAction::Reuse,
        ..Default::default()
    });

    let manager: KVHeavyTasksManager<CountingProvider> =
        KVHeavyTasksManager::new(config(1, 8, PriorityStrategy::Lifo(InterruptMode::Stop)));

    let long_events = Arc::new(Mutex::new(Vec::<(u32, u32)>::new()));
    let long_events2 = Arc::clone(&long_events);
    let (tx_long, rx_long) = oneshot::channel();
    manager.fetch(
        "longkey".to_string(),
        Some(Arc::new(move |p| long_events2.lock().unwrap().push(p))),
        move |outcome| {
            let _ = tx_long.send(outcome);
        },
    );

    // Give "longkey" a chance to reach its pause point before "short" arrives.
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(long_progress.load(Ordering::SeqCst), 2);

    set_next(CountingConfig {
        total: 1,
        ..Default::default()
    });
    let (tx_short, rx_short) = oneshot::channel();
    manager.fetch("short".to_string(), None, move |outcome| {
        let _ = tx_short.send(outcome);
    });
    assert_eq!(rx_short.await.unwrap(), Ok(Some("short".to_string())));

    // "longkey" is promoted back to running and finishes at total=7 without
    // its progress counter ever dropping back to 0.
    let long_outcome = rx_long.await.unwrap();
    assert_eq!(long_outcome, Ok(Some("longkey".to_string())));
    let events = long_events.lock().unwrap().clone();
    assert_eq!(events, vec![(1, 7), (2, 7), (3, 7), (4, 7), (5, 7), (6, 7), (7, 7)]);
    assert_eq!(events.last(), Some(&(7, 7)));
}

/// Scenario 3: overflow eviction. `M(R=1, Q=2, Fifo)`, five arrivals:
/// exactly t1..t3 succeed, t4 and t5 fail with `EvictedByPriorityStrategy`.
#[tokio::test]
async fn scenario_3_overflow_eviction_fails_newest_arrivals() {
    let gate = Arc::new(Mutex::new(Arc::new(Notify::new())));
    set_next(CountingConfig {
        total: 1,
        gate: Arc::clone(&gate),
        ..Default::default()
    });

    let manager: KVHeavyTasksManager<CountingProvider> =
        KVHeavyTasksManager::new(config(1, 2, PriorityStrategy::Fifo));

    let mut receivers = Vec::new();
    for k in ["t1", "t2", "t3", "t4", "t5"] {
        let (tx, rx) = oneshot::channel();
        manager.fetch(k.to_string(), None, move |outcome| {
            let _ = tx.send(outcome);
        });
        receivers.push((k, rx));
    }

    let mut succeeded = Vec::new();
    let mut evicted = Vec::new();
    for (k, rx) in receivers {
        let outcome = rx.await.unwrap();
        match outcome {
            Ok(Some(v)) => succeeded.push(v),
            Err(CoordinatorError::EvictedByPriorityStrategy) => evicted.push(k.to_string()),
            other => panic!("unexpected outcome for {k}: {other:?}"),
        }
    }

    succeeded.sort();
    evicted.sort();
    assert_eq!(succeeded, vec!["t1", "t2", "t3"]);
    assert_eq!(evicted, vec!["t4", "t5"]);
}

/// Scenario 4: no progress event is ever observed after the result callback.
#[tokio::test]
async fn scenario_4_no_event_after_result() {
    set_next(CountingConfig {
        total: 5,
        ..Default::default()
    });
    let manager: KVHeavyTasksManager<CountingProvider> =
        KVHeavyTasksManager::new(config(1, 8, PriorityStrategy::Fifo));

    let result_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let result_seen2 = Arc::clone(&result_seen);
    let (tx, rx) = oneshot::channel();
    manager.fetch(
        "lifecycle".to_string(),
        Some(Arc::new(move |_p: (u32, u32)| {
            assert!(
                !result_seen2.load(Ordering::SeqCst),
                "progress event observed after the result callback fired"
            );
        })),
        move |outcome| {
            result_seen.store(true, Ordering::SeqCst);
            let _ = tx.send(outcome);
        },
    );
    assert_eq!(rx.await.unwrap(), Ok(Some("lifecycle".to_string())));
    assert!(result_seen.load(Ordering::SeqCst));
}

/// Scenario 5: a MonoTask forced refresh that fails preserves the prior
/// cached value rather than invalidating it.
#[tokio::test]
async fn scenario_5_mono_task_forced_refresh_preserves_cache_on_failure() {
    use kv_heavy_tasks::{MonoTask, RetrySchedule};

    let attempt = Arc::new(AtomicUsize::new(0));
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
    let refresh = task.async_execute(true).await;
    assert_eq!(refresh, Err("boom".to_string()));

    assert_eq!(task.current_result(), Some("ok_1".to_string()));
    assert_eq!(task.async_execute(false).await.unwrap(), "ok_1");
}

/// Scenario 6: `KeyQueue` `contains` stays consistent after an eviction
/// sequence, and `count` tracks the number of live entries exactly.
#[test]
fn scenario_6_keyqueue_contains_after_eviction() {
    use kv_heavy_tasks::{EvictionPolicy, KeyQueue};

    let mut q: KeyQueue<char> = KeyQueue::new(3);
    for k in ['A', 'B', 'C', 'D'] {
        q.enqueue_front(k, EvictionPolicy::Fifo);
    }

    assert!(!q.contains(&'A'));
    for k in ['B', 'C', 'D'] {
        assert!(q.contains(&k));
    }
    assert_eq!(q.count(), 3);
}
