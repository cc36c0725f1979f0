//! Generic coalescing result cache
//!
//! [`AsyncResultCache`] maps an id to the result of an asynchronous build.
//! Concurrent lookups for the same id share one in-flight build, settled
//! entries are served until they expire, expired successes are served while a
//! replacement builds in the background, and failures are cached for a short,
//! separate TTL.
//!
//! # Slot states
//!
//! | State | Meaning |
//! |-------|---------|
//! | Pending | Only entry for the id is still building |
//! | Fresh | Settled and unexpired |
//! | Stale | Settled and expired, nothing building |
//! | Rebuilding | A replacement build is in flight |
//!
//! The lookup that decides between these states and inserts a new build runs
//! under a single synchronous lock and never spans an `.await`. Builds run in
//! their own tasks: a caller that stops waiting abandons the build but does
//! not cancel it, so its result still lands in the cache.

use crate::cache::clock::{duration_ms, Clock, SystemClock};
use crate::cache::metrics::{CacheEvent, MetricsSink, TracingMetrics};
use crate::error::{ServiceError, ServiceResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::any::Any;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Error TTL used when a lookup does not specify one
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(5);

type BuildFuture<V> = Shared<BoxFuture<'static, ServiceResult<V>>>;
type DisposeFn<V> = Arc<dyn Fn(String, V) -> BoxFuture<'static, ServiceResult<()>> + Send + Sync>;

/// Parameters for a single [`AsyncResultCache::get_meta`] call
#[derive(Debug, Clone)]
pub struct GetMetaOptions {
    pub id: String,
    pub time_to_live: Duration,
    /// Epoch-ms freshness floor; clamped to the current time
    pub newer_than: Option<u64>,
    pub error_time_to_live: Option<Duration>,
}

impl GetMetaOptions {
    pub fn new(id: impl Into<String>, time_to_live: Duration) -> Self {
        Self {
            id: id.into(),
            time_to_live,
            newer_than: None,
            error_time_to_live: None,
        }
    }

    pub fn newer_than(mut self, newer_than: Option<u64>) -> Self {
        self.newer_than = newer_than;
        self
    }

    pub fn error_time_to_live(mut self, ttl: Duration) -> Self {
        self.error_time_to_live = Some(ttl);
        self
    }
}

/// What a build callback produces
#[derive(Debug, Clone)]
pub struct Created<V> {
    pub result: V,
    /// Optional lifetime override; can only shorten the entry's TTL
    pub time_to_live: Option<Duration>,
}

impl<V> Created<V> {
    pub fn new(result: V) -> Self {
        Self {
            result,
            time_to_live: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// A settled cache value with its bookkeeping
#[derive(Debug, Clone)]
pub struct Meta<V> {
    pub created_time: u64,
    pub expiry_time: u64,
    pub hit_count: u64,
    pub result: V,
}

/// Observable state of the slot for one id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Fresh,
    Stale,
    Rebuilding,
}

struct Entry<V> {
    seq: u64,
    created_time: u64,
    expiry_time: AtomicU64,
    hit_count: AtomicU64,
    outcome: OnceLock<ServiceResult<V>>,
    build: BuildFuture<V>,
}

impl<V: Clone> Entry<V> {
    fn expiry(&self) -> u64 {
        self.expiry_time.load(Ordering::SeqCst)
    }

    fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }

    fn succeeded(&self) -> bool {
        matches!(self.outcome.get(), Some(Ok(_)))
    }

    fn value(&self) -> Option<V> {
        match self.outcome.get() {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn touch(&self) {
        self.hit_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct Slot<V> {
    current: Arc<Entry<V>>,
    replacement: Option<Arc<Entry<V>>>,
}

impl<V: Clone> Slot<V> {
    fn state(&self, now: u64) -> SlotState {
        if self.replacement.is_some() {
            SlotState::Rebuilding
        } else if !self.current.is_settled() {
            SlotState::Pending
        } else if now < self.current.expiry() {
            SlotState::Fresh
        } else {
            SlotState::Stale
        }
    }
}

struct Table<V> {
    slots: LruCache<String, Slot<V>>,
    capacity: usize,
    next_seq: u64,
}

impl<V: Clone> Table<V> {
    /// Pop least recently used idle slots until back within capacity.
    /// Slots with a build in flight are never chosen, so the table can run
    /// over capacity until they settle and a later insert trims it.
    fn evict_overflow(&mut self) -> Vec<(String, Slot<V>)> {
        let mut evicted = Vec::new();
        while self.slots.len() > self.capacity {
            let victim = self
                .slots
                .iter()
                .rev()
                .find(|(_, slot)| slot.replacement.is_none() && slot.current.is_settled())
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            if let Some(slot) = self.slots.pop(&key) {
                evicted.push((key, slot));
            }
        }
        evicted
    }
}

enum Step<V> {
    Ready(Arc<Entry<V>>),
    AwaitReplacement(Arc<Entry<V>>),
}

struct CacheInner<V> {
    name: &'static str,
    table: Mutex<Table<V>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    dispose: Option<DisposeFn<V>>,
}

/// Bounded, coalescing cache of asynchronously built values
pub struct AsyncResultCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for AsyncResultCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`AsyncResultCache`]
pub struct CacheBuilder<V> {
    name: &'static str,
    capacity: NonZeroUsize,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    dispose: Option<DisposeFn<V>>,
}

impl<V> CacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Hook run for every value that leaves the cache (eviction, replacement,
    /// teardown). Runs in its own task; errors are logged and dropped.
    pub fn dispose<F, Fut>(mut self, dispose: F) -> Self
    where
        F: Fn(String, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        self.dispose = Some(Arc::new(move |key, value| dispose(key, value).boxed()));
        self
    }

    pub fn build(self) -> AsyncResultCache<V> {
        AsyncResultCache {
            inner: Arc::new(CacheInner {
                name: self.name,
                table: Mutex::new(Table {
                    slots: LruCache::unbounded(),
                    capacity: self.capacity.get(),
                    next_seq: 0,
                }),
                clock: self.clock,
                metrics: self.metrics,
                dispose: self.dispose,
            }),
        }
    }
}

impl<V> AsyncResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: &'static str, capacity: NonZeroUsize) -> CacheBuilder<V> {
        CacheBuilder {
            name,
            capacity,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(TracingMetrics),
            dispose: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Look up `options.id`, building it with `create` when nothing usable
    /// is cached.
    ///
    /// `create` runs at most once per call and only when this call is the one
    /// that starts a build; concurrent callers share that build.
    pub async fn get_meta<F, Fut>(
        &self,
        options: GetMetaOptions,
        create: F,
    ) -> ServiceResult<Meta<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<Created<V>>> + Send + 'static,
    {
        let mut create = Some(create);
        loop {
            match self.inner.lookup(&options, &mut create)? {
                Step::Ready(entry) => return resolve(entry).await,
                Step::AwaitReplacement(replacement) => {
                    // Outcome is read from the table on the next pass
                    let _ = replacement.build.clone().await;
                }
            }
        }
    }

    /// State of the slot for `id`, without touching recency
    pub fn state(&self, id: &str) -> Option<SlotState> {
        let now = self.inner.clock.now_ms();
        self.inner.lock().slots.peek(id).map(|slot| slot.state(now))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().slots.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and dispose its value, waiting for disposal to
    /// finish. Builds still in flight dispose their own results on settle.
    pub async fn clear(&self) {
        let drained: Vec<(String, V)> = {
            let mut table = self.inner.lock();
            let mut drained = Vec::new();
            while let Some((key, slot)) = table.slots.pop_lru() {
                if let Some(value) = slot.current.value() {
                    drained.push((key, value));
                }
            }
            drained
        };

        if let Some(dispose) = &self.inner.dispose {
            for (key, value) in drained {
                if let Err(e) = dispose(key.clone(), value).await {
                    warn!("{}: failed to dispose {}: {}", self.inner.name, key, e);
                    self.inner.metrics.record(self.inner.name, CacheEvent::DisposeFailed);
                }
            }
        }
    }
}

async fn resolve<V: Clone>(entry: Arc<Entry<V>>) -> ServiceResult<Meta<V>> {
    let result = entry.build.clone().await?;
    Ok(Meta {
        created_time: entry.created_time,
        expiry_time: entry.expiry(),
        hit_count: entry.hit_count.load(Ordering::SeqCst),
        result,
    })
}

impl<V> CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Table<V>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup<F, Fut>(
        self: &Arc<Self>,
        options: &GetMetaOptions,
        create: &mut Option<F>,
    ) -> ServiceResult<Step<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<Created<V>>> + Send + 'static,
    {
        let now = self.clock.now_ms();
        let newer_than = options.newer_than.map_or(0, |t| t.min(now));
        let mut evicted = Vec::new();

        let step = {
            let mut guard = self.lock();
            let table = &mut *guard;

            match table.slots.get_mut(&options.id) {
                Some(slot) => {
                    let state = slot.state(now);
                    let current_satisfies = slot.current.created_time >= newer_than;

                    match (state, slot.replacement.clone()) {
                        (SlotState::Pending | SlotState::Fresh | SlotState::Rebuilding, _)
                            if current_satisfies && servable(state, &slot.current, now) =>
                        {
                            debug!("{}: hit {} ({:?})", self.name, options.id, state);
                            self.metrics.record(self.name, CacheEvent::Hit);
                            slot.current.touch();
                            Step::Ready(Arc::clone(&slot.current))
                        }
                        (_, Some(replacement)) => {
                            debug!("{}: waiting on rebuild of {}", self.name, options.id);
                            self.metrics.record(self.name, CacheEvent::ReplacementAwaited);
                            Step::AwaitReplacement(replacement)
                        }
                        (_, None) => {
                            let create = take_callback(create)?;
                            let seq = next_seq(&mut table.next_seq);
                            debug!("{}: rebuilding {} ({:?})", self.name, options.id, state);
                            self.metrics.record(self.name, CacheEvent::Miss);
                            let entry = self.spawn_build(options, seq, now, create);
                            slot.replacement = Some(Arc::clone(&entry));

                            if current_satisfies && slot.current.succeeded() {
                                self.metrics.record(self.name, CacheEvent::StaleServed);
                                slot.current.touch();
                                Step::Ready(Arc::clone(&slot.current))
                            } else {
                                Step::Ready(entry)
                            }
                        }
                    }
                }
                None => {
                    let create = take_callback(create)?;
                    let seq = next_seq(&mut table.next_seq);
                    debug!("{}: miss {}", self.name, options.id);
                    self.metrics.record(self.name, CacheEvent::Miss);
                    let entry = self.spawn_build(options, seq, now, create);
                    let slot = Slot {
                        current: Arc::clone(&entry),
                        replacement: None,
                    };
                    table.slots.put(options.id.clone(), slot);
                    evicted = table.evict_overflow();
                    Step::Ready(entry)
                }
            }
        };

        for (key, slot) in evicted {
            debug!("{}: evicting {}", self.name, key);
            self.metrics.record(self.name, CacheEvent::Evicted);
            if let Some(value) = slot.current.value() {
                self.dispose_later(key, value);
            }
        }

        Ok(step)
    }

    fn spawn_build<F, Fut>(
        self: &Arc<Self>,
        options: &GetMetaOptions,
        seq: u64,
        now: u64,
        create: F,
    ) -> Arc<Entry<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<Created<V>>> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let id = options.id.clone();
        let error_ttl = options.error_time_to_live.unwrap_or(DEFAULT_ERROR_TTL);

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { create().await })
                .catch_unwind()
                .await;
            inner.settle(&id, seq, error_ttl, outcome)
        });

        let build = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ServiceError::Internal(format!("build task aborted: {}", e))),
            }
        }
        .boxed()
        .shared();

        Arc::new(Entry {
            seq,
            created_time: now,
            expiry_time: AtomicU64::new(now.saturating_add(duration_ms(options.time_to_live))),
            hit_count: AtomicU64::new(0),
            outcome: OnceLock::new(),
            build,
        })
    }

    /// Record a finished build in whichever entry still owns `seq`
    fn settle(
        &self,
        id: &str,
        seq: u64,
        error_ttl: Duration,
        outcome: Result<ServiceResult<Created<V>>, Box<dyn Any + Send>>,
    ) -> ServiceResult<V> {
        let now = self.clock.now_ms();

        let (result, ttl_override) = match outcome {
            Ok(Ok(created)) => (Ok(created.result), created.time_to_live),
            Ok(Err(e)) => (Err(e), None),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{}: build callback for {} panicked: {}", self.name, id, message);
                self.metrics.record(self.name, CacheEvent::BuildPanicked);
                (
                    Err(ServiceError::Programmer {
                        id: id.to_string(),
                        message,
                    }),
                    None,
                )
            }
        };

        let cacheable = match &result {
            Ok(_) => true,
            Err(e) => e.is_cacheable(),
        };
        let mut disposals = Vec::new();

        {
            let mut guard = self.lock();
            let table = &mut *guard;
            let mut drop_slot = false;

            match table.slots.peek_mut(id) {
                Some(slot) if slot.current.seq == seq => {
                    let entry = Arc::clone(&slot.current);
                    self.apply(&entry, now, ttl_override, error_ttl, &result);
                    // Never keep a programmer error; the next lookup rebuilds
                    if !cacheable {
                        match slot.replacement.take() {
                            Some(replacement) => slot.current = replacement,
                            None => drop_slot = true,
                        }
                    }
                }
                Some(slot) if slot.replacement.as_ref().is_some_and(|r| r.seq == seq) => {
                    if let Some(entry) = slot.replacement.take() {
                        self.apply(&entry, now, ttl_override, error_ttl, &result);
                        if cacheable {
                            let old = std::mem::replace(&mut slot.current, entry);
                            self.metrics.record(self.name, CacheEvent::Replaced);
                            if let Some(value) = old.value() {
                                disposals.push((id.to_string(), value));
                            }
                        }
                    }
                }
                _ => {
                    debug!("{}: build for {} finished after its slot was dropped", self.name, id);
                    if let Ok(value) = &result {
                        disposals.push((id.to_string(), value.clone()));
                    }
                }
            }

            if drop_slot {
                table.slots.pop(id);
            }
        }

        match &result {
            Ok(_) => self.metrics.record(self.name, CacheEvent::BuildSucceeded),
            Err(e) if cacheable => {
                debug!("{}: caching failure for {}: {}", self.name, id, e);
                self.metrics.record(self.name, CacheEvent::BuildFailed);
            }
            Err(_) => {}
        }

        for (key, value) in disposals {
            self.dispose_later(key, value);
        }

        result
    }

    fn apply(
        &self,
        entry: &Entry<V>,
        now: u64,
        ttl_override: Option<Duration>,
        error_ttl: Duration,
        result: &ServiceResult<V>,
    ) {
        match result {
            Ok(_) => {
                if let Some(ttl) = ttl_override {
                    let tightened = now.saturating_add(duration_ms(ttl));
                    entry.expiry_time.fetch_min(tightened, Ordering::SeqCst);
                }
            }
            Err(_) => {
                entry
                    .expiry_time
                    .store(now.saturating_add(duration_ms(error_ttl)), Ordering::SeqCst);
            }
        }
        let _ = entry.outcome.set(result.clone());
    }

    fn dispose_later(&self, key: String, value: V) {
        let Some(dispose) = &self.dispose else {
            return;
        };
        let name = self.name;
        let metrics = Arc::clone(&self.metrics);
        let pending = dispose(key.clone(), value);
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                warn!("{}: failed to dispose {}: {}", name, key, e);
                metrics.record(name, CacheEvent::DisposeFailed);
            }
        });
    }
}

/// Expired failures are never replayed, even while a rebuild is in flight
fn servable<V: Clone>(state: SlotState, current: &Entry<V>, now: u64) -> bool {
    state != SlotState::Rebuilding || current.succeeded() || now < current.expiry()
}

fn take_callback<F>(create: &mut Option<F>) -> ServiceResult<F> {
    create
        .take()
        .ok_or_else(|| ServiceError::Internal("build callback already consumed".to_string()))
}

fn next_seq(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
