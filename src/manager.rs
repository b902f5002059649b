//! The keyed scheduler over long-running, interruptible data providers
//! (§4.4). `KVHeavyTasksManager<Pr>` is the hard core of this crate: it
//! composes a result cache, a resume-data cache, a bounded running set, a
//! bounded waiting [`KeyQueue`], and a pool of resumable provider instances
//! behind a single `fetch(key, event?, result)` entry point.
//!
//! All bookkeeping — `records`, `running`, `waiting`, `paused` — lives
//! behind one `Mutex<State<Pr>>` (§5 "single internal mutual-exclusion
//! region"). Provider methods (`construct`, `start`, `stop`) and callback
//! deliveries are always invoked after that lock is released; the two
//! caches carry their own independent locking and are safe to touch while
//! holding or not holding the manager's lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::{CacheHit, CacheRecord, CacheStatistics, InMemoryCache};
use crate::config::{InterruptMode, ManagerConfig, PriorityStrategy};
use crate::error::{CoordinatorError, FetchResult};
use crate::keyqueue::{EvictionPolicy, KeyQueue};
use crate::provider::{guard_once, EventSink, Provider, ResultSink, StopAction};

type ResultCallbackBox<V, E> = Box<dyn FnOnce(FetchResult<V, E>) + Send>;

struct Callback<Pr: Provider> {
    event: Option<EventSink<Pr::Progress>>,
    result: ResultCallbackBox<Pr::Value, Pr::Error>,
}

/// Where a [`TaskRecord`] currently sits (§3 "TaskRecord (manager)").
/// `Finishing` is not tracked explicitly: completion removes the record
/// from `State::records` atomically under the manager lock, which gives
/// the same "no event observed after this point" guarantee with one fewer
/// state to keep in sync (DESIGN.md open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
}

struct TaskRecord<Pr: Provider> {
    callbacks: Vec<Callback<Pr>>,
    phase: Phase,
}

/// A capacity slot in `State::running`. Inserted with `provider: None` the
/// instant an admission decision reserves it — before the provider is
/// constructed or started — so that a concurrent `fetch` on another thread
/// sees the reservation in `running.len()` and can never over-admit past
/// `max_running` in the window between the decision and `execute_start`
/// finishing outside the lock (§4.4.3 capacity invariant).
struct RunningSlot<Pr: Provider> {
    provider: Option<Arc<Mutex<Pr>>>,
    admitted_at: u64,
}

struct State<Pr: Provider> {
    records: HashMap<Pr::Key, TaskRecord<Pr>>,
    waiting: KeyQueue<Pr::Key>,
    running: HashMap<Pr::Key, RunningSlot<Pr>>,
    /// Retained provider instances from a `StopAction::Reuse` preemption,
    /// keyed by the key they belong to (§4.4.5, §4.4.6).
    paused: HashMap<Pr::Key, Arc<Mutex<Pr>>>,
}

struct Inner<Pr: Provider> {
    config: ManagerConfig,
    result_cache: InMemoryCache<Pr::Key, Pr::Value>,
    resume_cache: InMemoryCache<Pr::Key, Vec<u8>>,
    state: Mutex<State<Pr>>,
    admission_seq: AtomicU64,
}

/// A scheduler over `Pr`-shaped providers, bounded by `ManagerConfig`
/// (§4.4). Cheap to clone: every clone shares the same underlying state.
pub struct KVHeavyTasksManager<Pr: Provider> {
    inner: Arc<Inner<Pr>>,
}

impl<Pr: Provider> Clone for KVHeavyTasksManager<Pr> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Pr: Provider> KVHeavyTasksManager<Pr> {
    /// Builds a manager with no cache-statistics reporting wired in.
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None)
    }

    /// Builds a manager whose result and resume caches both report every
    /// operation to `sink` (§4.4.1 `cache_statistics_report`).
    pub fn with_cache_statistics_report<F>(config: ManagerConfig, sink: F) -> Self
    where
        F: Fn(&CacheStatistics, &CacheRecord<Pr::Key>) + Send + Sync + Clone + 'static,
    {
        Self::build(config, Some(sink))
    }

    fn build<F>(config: ManagerConfig, sink: Option<F>) -> Self
    where
        F: Fn(&CacheStatistics, &CacheRecord<Pr::Key>) + Send + Sync + Clone + 'static,
    {
        let max_queueing = config.max_queueing;
        let mut result_cache = InMemoryCache::new(config.result_cache.clone());
        let mut resume_cache = InMemoryCache::new(config.resume_cache.clone());
        if let Some(sink) = sink {
            result_cache = result_cache.with_statistics_sink(sink.clone());
            resume_cache = resume_cache.with_statistics_sink(sink);
        }

        Self {
            inner: Arc::new(Inner {
                config,
                result_cache,
                resume_cache,
                state: Mutex::new(State {
                    records: HashMap::new(),
                    waiting: KeyQueue::new(max_queueing),
                    running: HashMap::new(),
                    paused: HashMap::new(),
                }),
                admission_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Requests the value for `key` (§4.4.3).
    ///
    /// `event`, if present, receives every progress payload the underlying
    /// provider publishes for this key from this point on, until the
    /// result fires (§5 ordering guarantee 1). `result` fires exactly once
    /// with `Ok(Some(value))`, `Ok(None)`, or `Err(...)` — never inline on
    /// the caller's stack (§5 ordering guarantee 3).
    pub fn fetch(
        &self,
        key: Pr::Key,
        event: Option<EventSink<Pr::Progress>>,
        result: impl FnOnce(FetchResult<Pr::Value, Pr::Error>) + Send + 'static,
    ) {
        let result_cb: ResultCallbackBox<Pr::Value, Pr::Error> = Box::new(result);

        match self.inner.result_cache.get(&key) {
            CacheHit::HitValue(value) => {
                spawn_deliver(result_cb, Ok(Some(value)));
                return;
            }
            CacheHit::HitNull => {
                spawn_deliver(result_cb, Ok(None));
                return;
            }
            CacheHit::InvalidKey => {
                spawn_deliver(result_cb, Ok(None));
                return;
            }
            CacheHit::Miss => {}
        }

        admit(&self.inner, key, Callback { event, result: result_cb });
    }

    /// Number of providers currently in the running phase. For tests and
    /// callers that want to observe the capacity invariant of §8 directly.
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().unwrap().running.len()
    }

    /// Number of keys currently parked in the waiting queue.
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().unwrap().waiting.count()
    }

    /// Snapshot of the result cache's statistics.
    pub fn result_cache_statistics(&self) -> CacheStatistics {
        self.inner.result_cache.statistics()
    }

    /// Snapshot of the resume cache's statistics.
    pub fn resume_cache_statistics(&self) -> CacheStatistics {
        self.inner.resume_cache.statistics()
    }
}

fn spawn_deliver<V, E>(cb: ResultCallbackBox<V, E>, outcome: FetchResult<V, E>)
where
    V: Send + 'static,
    E: Send + 'static,
{
    tokio::spawn(async move { cb(outcome) });
}

fn fail_evicted<Pr: Provider>(callbacks: Vec<Callback<Pr>>) {
    for cb in callbacks {
        let result = cb.result;
        tokio::spawn(async move { result(Err(CoordinatorError::EvictedByPriorityStrategy)) });
    }
}

/// What [`execute_start`] should do to obtain a live provider instance.
enum StartSpec<Pr: Provider> {
    /// A previously preempted (`StopAction::Reuse`) instance; just restart it.
    Retained(Arc<Mutex<Pr>>),
    /// Construct a fresh instance, optionally resuming from cached data.
    Fresh(Option<Vec<u8>>),
}

/// Looks up a retained instance or cached resume data for `key` (§4.4.5).
/// Must be called with `state` locked; does not itself call into the
/// provider.
fn prepare_start<Pr: Provider>(
    inner: &Arc<Inner<Pr>>,
    state: &mut State<Pr>,
    key: &Pr::Key,
) -> StartSpec<Pr> {
    if let Some(provider) = state.paused.remove(key) {
        return StartSpec::Retained(provider);
    }
    let resume_data = match inner.resume_cache.get(key) {
        CacheHit::HitValue(data) => Some(data),
        _ => None,
    };
    StartSpec::Fresh(resume_data)
}

/// Admits `key` to the running phase: resumes a retained instance or
/// constructs a fresh one, then calls `start()` — always outside the
/// manager's lock (§5 "Providers are never called while holding the
/// region"). `admitted_at` must already have been assigned (via
/// `inner.admission_seq.fetch_add`) under the same `state` lock that made
/// the admission decision, so that sequence numbers are ordered the same
/// way admissions actually happened even when multiple `fetch`es reach
/// `execute_start` concurrently on different worker threads (§5, §9 open
/// question (b)). Likewise, the caller must already have reserved `key`'s
/// spot in `state.running` (a `RunningSlot { provider: None, .. }`) under
/// that same lock, so the capacity this call is about to fill was already
/// counted against `max_running` the instant the decision was made — this
/// call only fills in the provider, it never grows `running.len()`.
fn execute_start<Pr: Provider>(
    inner: &Arc<Inner<Pr>>,
    key: Pr::Key,
    spec: StartSpec<Pr>,
    admitted_at: u64,
) {
    let provider_arc = match spec {
        StartSpec::Retained(arc) => {
            debug!("resuming a retained provider instance");
            arc
        }
        StartSpec::Fresh(resume_data) => {
            let had_resume_data = resume_data.is_some();
            let event_sink = build_event_sink(inner, key.clone());
            let result_sink = build_result_sink(inner, key.clone());
            debug!(had_resume_data, "constructing a fresh provider instance");
            Arc::new(Mutex::new(Pr::construct(
                key.clone(),
                resume_data,
                event_sink,
                result_sink,
            )))
        }
    };

    provider_arc.lock().unwrap().start();

    let mut state = inner.state.lock().unwrap();
    match state.running.get_mut(&key) {
        Some(slot) => slot.provider = Some(provider_arc),
        None => {
            // Defensive: every call site reserves the slot before calling
            // this function. Fall back to inserting one rather than losing
            // the now-started provider.
            state.running.insert(
                key,
                RunningSlot {
                    provider: Some(provider_arc),
                    admitted_at,
                },
            );
        }
    }
}

/// Routes every progress payload a provider publishes for `key` to every
/// callback currently registered for it (§4.4.5). Looked up fresh on every
/// call so late-joining subscribers see subsequent events, and a record
/// that has already completed (removed from `records`) silently drops
/// further events (§5 ordering guarantee 1).
fn build_event_sink<Pr: Provider>(inner: &Arc<Inner<Pr>>, key: Pr::Key) -> EventSink<Pr::Progress> {
    let inner = Arc::clone(inner);
    Arc::new(move |progress: Pr::Progress| {
        let observers: Vec<EventSink<Pr::Progress>> = {
            let state = inner.state.lock().unwrap();
            match state.records.get(&key) {
                Some(record) => record
                    .callbacks
                    .iter()
                    .filter_map(|cb| cb.event.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        for observer in observers {
            observer(progress.clone());
        }
    })
}

/// Builds the at-most-once result sink handed to a freshly constructed
/// provider (§4.4.6, §7 kind 4).
fn build_result_sink<Pr: Provider>(
    inner: &Arc<Inner<Pr>>,
    key: Pr::Key,
) -> ResultSink<Pr::Value, Pr::Error> {
    let inner = Arc::clone(inner);
    guard_once(move |outcome: Result<Option<Pr::Value>, Pr::Error>| {
        complete(&inner, key.clone(), outcome);
    })
}

/// Handles `fetch`'s admission decision (§4.4.3, §4.4.4): attach to an
/// existing record, admit straight to running, queue behind capacity, or
/// — under `Lifo(Stop)` contention — preempt the earliest-started running
/// key to make room.
fn admit<Pr: Provider>(inner: &Arc<Inner<Pr>>, key: Pr::Key, cb: Callback<Pr>) {
    enum Outcome<Pr: Provider> {
        Start {
            key: Pr::Key,
            spec: StartSpec<Pr>,
            admitted_at: u64,
        },
        Preempt {
            victim_key: Pr::Key,
            victim_provider: Arc<Mutex<Pr>>,
            new_key: Pr::Key,
            admitted_at: u64,
        },
        Queued {
            evicted_record: Option<TaskRecord<Pr>>,
        },
    }

    let outcome = {
        let mut state = inner.state.lock().unwrap();

        if let Some(record) = state.records.get_mut(&key) {
            record.callbacks.push(cb);
            return;
        }

        if state.running.len() < inner.config.max_running {
            state.records.insert(
                key.clone(),
                TaskRecord {
                    callbacks: vec![cb],
                    phase: Phase::Running,
                },
            );
            let spec = prepare_start(inner, &mut state, &key);
            let admitted_at = inner.admission_seq.fetch_add(1, Ordering::SeqCst);
            // Reserve the slot now, under this lock, so a concurrent
            // `fetch` on another thread sees `running.len()` already
            // reflecting this admission before `execute_start` finishes
            // constructing and starting the provider outside the lock.
            state.running.insert(
                key.clone(),
                RunningSlot {
                    provider: None,
                    admitted_at,
                },
            );
            Outcome::Start {
                key,
                spec,
                admitted_at,
            }
        } else {
            match inner.config.priority_strategy {
                PriorityStrategy::Fifo | PriorityStrategy::Lifo(InterruptMode::Await) => {
                    Outcome::Queued {
                        evicted_record: enqueue_waiting(&mut state, key, cb),
                    }
                }
                PriorityStrategy::Lifo(InterruptMode::Stop) => {
                    // Only consider slots whose provider has actually been
                    // constructed — a slot reserved by a concurrent
                    // admission that hasn't reached `execute_start` yet has
                    // nothing to `stop()`.
                    let victim = state
                        .running
                        .iter()
                        .filter(|(_, slot)| slot.provider.is_some())
                        .min_by_key(|(_, slot)| slot.admitted_at)
                        .map(|(k, _)| k.clone());

                    match victim {
                        None => {
                            // max_running == 0 (§9 open question (a)), or
                            // every running slot is still a pending
                            // reservation: no running record can be
                            // preempted right now.
                            Outcome::Queued {
                                evicted_record: enqueue_waiting(&mut state, key, cb),
                            }
                        }
                        Some(victim_key) => {
                            let slot = state
                                .running
                                .remove(&victim_key)
                                .expect("victim key observed in the running set");
                            let victim_provider = slot
                                .provider
                                .expect("victim was filtered to providers already constructed");
                            let admitted_at = inner.admission_seq.fetch_add(1, Ordering::SeqCst);
                            state.records.insert(
                                key.clone(),
                                TaskRecord {
                                    callbacks: vec![cb],
                                    phase: Phase::Running,
                                },
                            );
                            // Reserve the freed slot for the new key in the
                            // same lock acquisition that removed the
                            // victim, so `running.len()` never dips and
                            // reopens the slot to a third, concurrent
                            // admission.
                            state.running.insert(
                                key.clone(),
                                RunningSlot {
                                    provider: None,
                                    admitted_at,
                                },
                            );
                            Outcome::Preempt {
                                victim_key,
                                victim_provider,
                                new_key: key,
                                admitted_at,
                            }
                        }
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Start {
            key,
            spec,
            admitted_at,
        } => execute_start(inner, key, spec, admitted_at),
        Outcome::Preempt {
            victim_key,
            victim_provider,
            new_key,
            admitted_at,
        } => preempt_and_start(inner, victim_key, victim_provider, new_key, admitted_at),
        Outcome::Queued { evicted_record } => {
            if let Some(record) = evicted_record {
                warn!("waiting record evicted by priority strategy");
                fail_evicted(record.callbacks);
            }
        }
    }
}

/// Pushes `key` to the front of the waiting queue, returning the record of
/// whatever got evicted to make room if the queue is already at
/// `max_queueing` (§4.4.4, resolved per the literal §8 scenario 3 numbers: a
/// full waiting queue rejects the new arrival rather than bumping an
/// existing waiter — see DESIGN.md). The caller fails the evicted record's
/// callbacks itself, after releasing the manager lock — this function never
/// spawns anything while `state` is locked.
fn enqueue_waiting<Pr: Provider>(
    state: &mut State<Pr>,
    key: Pr::Key,
    cb: Callback<Pr>,
) -> Option<TaskRecord<Pr>> {
    state.records.insert(
        key.clone(),
        TaskRecord {
            callbacks: vec![cb],
            phase: Phase::Waiting,
        },
    );
    let evicted = state.waiting.enqueue_front(key, EvictionPolicy::Lifo);
    evicted.and_then(|evicted_key| state.records.remove(&evicted_key))
}

/// Carries out a `Lifo(Stop)` preemption (§4.4.4, §4.4.6): stops the
/// victim's provider outside the lock, persists or retains it depending on
/// `StopAction`, parks the victim at the front of the waiting queue, and
/// finally admits the interrupting key to the freed running slot. The
/// victim's own restart only happens later via [`promote_next`], which by
/// construction cannot run before this function's `execute_start` call
/// returns (§5 ordering guarantee 4).
///
/// Parking the victim is capacity-bounded exactly like any other arrival at
/// the waiting queue, but — unlike the genuinely ambiguous new-arrival case
/// `enqueue_waiting` resolves (DESIGN.md open question (d)) — SPEC_FULL.md
/// §4.4.4 is explicit here: "Eviction from `waiting` on overflow still
/// targets the back." So this call uses `EvictionPolicy::Fifo` (evict the
/// oldest waiting entry), not the newcomer-rejecting policy
/// `enqueue_waiting` uses.
///
/// `new_key`'s running slot and `admitted_at` have already been reserved by
/// [`admit`], in the same lock acquisition that removed the victim from
/// `running` — so `running.len()` never dips between the victim leaving and
/// the newcomer's slot existing, closing the window a third concurrent
/// `fetch` could otherwise slip into.
fn preempt_and_start<Pr: Provider>(
    inner: &Arc<Inner<Pr>>,
    victim_key: Pr::Key,
    victim_provider: Arc<Mutex<Pr>>,
    new_key: Pr::Key,
    admitted_at: u64,
) {
    info!("preempting the earliest-started running key to admit a new arrival");
    let stop_action = victim_provider.lock().unwrap().stop();
    let resume_data = if stop_action == StopAction::Dealloc {
        victim_provider.lock().unwrap().resume_data()
    } else {
        None
    };

    let (spec, evicted_record) = {
        let mut state = inner.state.lock().unwrap();

        match stop_action {
            StopAction::Reuse => {
                state.paused.insert(victim_key.clone(), victim_provider);
            }
            StopAction::Dealloc => {
                if let Some(data) = resume_data.filter(|d| !d.is_empty()) {
                    inner.resume_cache.set(victim_key.clone(), Some(data), None);
                }
            }
        }

        if let Some(record) = state.records.get_mut(&victim_key) {
            record.phase = Phase::Waiting;
        }

        let evicted = state.waiting.enqueue_front(victim_key, EvictionPolicy::Fifo);
        let evicted_record = evicted.and_then(|k| state.records.remove(&k));

        let spec = prepare_start(inner, &mut state, &new_key);
        (spec, evicted_record)
    };

    if let Some(record) = evicted_record {
        warn!("waiting record evicted while parking a preempted key");
        fail_evicted(record.callbacks);
    }

    execute_start(inner, new_key, spec, admitted_at);
}

/// The provider's `result_sink` callback (§4.4.6): marks the record
/// finished, publishes to the result cache on success, drains every
/// registered result callback exactly once in registration order, frees
/// the running slot, and promotes the next waiting key.
fn complete<Pr: Provider>(
    inner: &Arc<Inner<Pr>>,
    key: Pr::Key,
    outcome: Result<Option<Pr::Value>, Pr::Error>,
) {
    let callbacks = {
        let mut state = inner.state.lock().unwrap();
        state.running.remove(&key);
        state.paused.remove(&key);
        match state.records.remove(&key) {
            Some(record) => record.callbacks,
            None => Vec::new(),
        }
    };

    if let Ok(value) = &outcome {
        inner.result_cache.set(key.clone(), value.clone(), None);
    }

    let delivered = callbacks.len();
    for cb in callbacks {
        let outcome = outcome.clone().map_err(CoordinatorError::ProviderFailure);
        let result = cb.result;
        tokio::spawn(async move { result(outcome) });
    }
    debug!(delivered, "result delivered to registered callbacks");

    promote_next(inner);
}

/// Frees a running slot: pops the next key per priority policy (back for
/// FIFO — oldest first; front for either LIFO mode — newest first) and
/// admits it (§4.4.4, §4.4.6 step 4).
fn promote_next<Pr: Provider>(inner: &Arc<Inner<Pr>>) {
    let (key, spec, admitted_at) = {
        let mut state = inner.state.lock().unwrap();
        if state.running.len() >= inner.config.max_running {
            return;
        }

        let next_key = match inner.config.priority_strategy {
            PriorityStrategy::Fifo => state.waiting.dequeue_back(),
            PriorityStrategy::Lifo(_) => state.waiting.dequeue_front(),
        };
        let Some(key) = next_key else {
            return;
        };

        if let Some(record) = state.records.get_mut(&key) {
            record.phase = Phase::Running;
        }
        let spec = prepare_start(inner, &mut state, &key);
        let admitted_at = inner.admission_seq.fetch_add(1, Ordering::SeqCst);
        state.running.insert(
            key.clone(),
            RunningSlot {
                provider: None,
                admitted_at,
            },
        );
        (key, spec, admitted_at)
    };

    execute_start(inner, key, spec, admitted_at);
}
