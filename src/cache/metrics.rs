//! Instrumentation sink injected into each cache
//!
//! Recording is separated from consumption: caches only call
//! [`MetricsSink::record`]; whoever owns the sink decides whether events are
//! logged, counted, or exported.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::trace;

/// Events a cache reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    /// Lookup served by an existing entry (fresh or in flight)
    Hit,
    /// Lookup found nothing usable and started a build
    Miss,
    /// Expired success served while a replacement builds
    StaleServed,
    /// Caller waited on a pending replacement
    ReplacementAwaited,
    /// Build settled successfully
    BuildSucceeded,
    /// Build settled with a cached error
    BuildFailed,
    /// Build callback panicked
    BuildPanicked,
    /// Entry dropped to stay within capacity
    Evicted,
    /// Old entry swapped out by its settled replacement
    Replaced,
    /// Disposal hook returned an error
    DisposeFailed,
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::StaleServed => "stale_served",
            Self::ReplacementAwaited => "replacement_awaited",
            Self::BuildSucceeded => "build_succeeded",
            Self::BuildFailed => "build_failed",
            Self::BuildPanicked => "build_panicked",
            Self::Evicted => "evicted",
            Self::Replaced => "replaced",
            Self::DisposeFailed => "dispose_failed",
        };
        write!(f, "{}", name)
    }
}

/// Receives cache events
pub trait MetricsSink: Send + Sync {
    fn record(&self, cache: &str, event: CacheEvent);
}

/// Sink that emits each event as a trace-level log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, cache: &str, event: CacheEvent) {
        trace!(cache, %event, "cache event");
    }
}

/// Sink that counts events per cache, for tests and end-of-run summaries
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counts: Mutex<HashMap<(String, CacheEvent), u64>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `event` was recorded for `cache`
    pub fn count(&self, cache: &str, event: CacheEvent) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(&(cache.to_string(), event)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All non-zero counters, sorted by cache then event name
    pub fn snapshot(&self) -> Vec<(String, CacheEvent, u64)> {
        let mut rows: Vec<_> = match self.counts.lock() {
            Ok(counts) => counts
                .iter()
                .map(|((cache, event), n)| (cache.clone(), *event, *n))
                .collect(),
            Err(_) => Vec::new(),
        };
        rows.sort_by(|a, b| (&a.0, a.1.to_string()).cmp(&(&b.0, b.1.to_string())));
        rows
    }
}

impl MetricsSink for CountingMetrics {
    fn record(&self, cache: &str, event: CacheEvent) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry((cache.to_string(), event)).or_insert(0) += 1;
        }
    }
}
