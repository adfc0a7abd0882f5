//! Observation hooks for scans, cache traffic and queries.
//!
//! The engine reports what it does through a [`ScanEvents`] sink instead of
//! logging directly, so tests can count events and embedders can route them
//! elsewhere. [`TracingEvents`] is the default and forwards to `tracing`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

/// Why a container had to be rescanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Nothing stored under the container's key.
    Absent,
    /// Stored identity no longer matches the container.
    Stale,
    /// Stored blob could not be decoded.
    Corrupt,
    /// An explicit invalidation forced the rescan.
    Forced,
    /// Caching is disabled.
    Disabled,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Stale => "stale",
            Self::Corrupt => "corrupt",
            Self::Forced => "forced",
            Self::Disabled => "disabled",
        }
    }
}

pub trait ScanEvents: Send + Sync {
    fn cache_hit(&self, _path: &str, _from_store: bool) {}
    fn cache_miss(&self, _path: &str, _reason: MissReason) {}
    fn class_failed(&self, _path: &str, _entry: &str, _reason: &str) {}
    fn partial_scan(&self, _path: &str, _failures: usize, _classes: usize) {}
    fn cache_written(&self, _path: &str, _bytes: usize) {}
    fn cache_write_failed(&self, _path: &str, _reason: &str) {}
    fn cache_corrupt(&self, _path: &str, _reason: &str) {}
    fn invalidated(&self, _path: &str) {}
    fn query(&self, _kind: &str, _target: &str, _results: usize) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl ScanEvents for NoopEvents {}

/// Forwards events to `tracing`. Queries are logged only when asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents {
    pub log_queries: bool,
}

impl TracingEvents {
    pub fn new(log_queries: bool) -> Self {
        Self { log_queries }
    }
}

impl ScanEvents for TracingEvents {
    fn cache_hit(&self, path: &str, from_store: bool) {
        debug!(container = path, from_store, "index cache hit");
    }

    fn cache_miss(&self, path: &str, reason: MissReason) {
        debug!(container = path, reason = reason.as_str(), "index cache miss");
    }

    fn class_failed(&self, path: &str, entry: &str, reason: &str) {
        debug!(container = path, entry, reason, "class entry failed to decode");
    }

    fn partial_scan(&self, path: &str, failures: usize, classes: usize) {
        warn!(
            container = path,
            failures, classes, "container scanned with undecodable entries"
        );
    }

    fn cache_written(&self, path: &str, bytes: usize) {
        debug!(container = path, bytes, "index written");
    }

    fn cache_write_failed(&self, path: &str, reason: &str) {
        warn!(container = path, reason, "index write failed; continuing without cache");
    }

    fn cache_corrupt(&self, path: &str, reason: &str) {
        warn!(container = path, reason, "stored index corrupt; rescanning");
    }

    fn invalidated(&self, path: &str) {
        info!(container = path, "index invalidated");
    }

    fn query(&self, kind: &str, target: &str, results: usize) {
        if self.log_queries {
            info!(kind, target, results, "query");
        }
    }
}

/// Counts events. Used by tests and by `stats`.
#[derive(Debug, Default)]
pub struct EventCounters {
    pub hits: AtomicU64,
    pub store_hits: AtomicU64,
    pub misses: AtomicU64,
    pub class_failures: AtomicU64,
    pub partial_scans: AtomicU64,
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub corrupt: AtomicU64,
    pub invalidations: AtomicU64,
    pub queries: AtomicU64,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

impl ScanEvents for EventCounters {
    fn cache_hit(&self, _path: &str, from_store: bool) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if from_store {
            self.store_hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache_miss(&self, _path: &str, _reason: MissReason) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn class_failed(&self, _path: &str, _entry: &str, _reason: &str) {
        self.class_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn partial_scan(&self, _path: &str, _failures: usize, _classes: usize) {
        self.partial_scans.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_written(&self, _path: &str, _bytes: usize) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_write_failed(&self, _path: &str, _reason: &str) {
        self.write_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_corrupt(&self, _path: &str, _reason: &str) {
        self.corrupt.fetch_add(1, Ordering::SeqCst);
    }

    fn invalidated(&self, _path: &str) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn query(&self, _kind: &str, _target: &str, _results: usize) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts every event and forwards it to another sink.
pub struct CountingEvents {
    counters: Arc<EventCounters>,
    inner: Arc<dyn ScanEvents>,
}

impl CountingEvents {
    pub fn new(inner: Arc<dyn ScanEvents>) -> Self {
        Self {
            counters: Arc::new(EventCounters::new()),
            inner,
        }
    }

    pub fn counters(&self) -> &Arc<EventCounters> {
        &self.counters
    }
}

impl ScanEvents for CountingEvents {
    fn cache_hit(&self, path: &str, from_store: bool) {
        self.counters.cache_hit(path, from_store);
        self.inner.cache_hit(path, from_store);
    }

    fn cache_miss(&self, path: &str, reason: MissReason) {
        self.counters.cache_miss(path, reason);
        self.inner.cache_miss(path, reason);
    }

    fn class_failed(&self, path: &str, entry: &str, reason: &str) {
        self.counters.class_failed(path, entry, reason);
        self.inner.class_failed(path, entry, reason);
    }

    fn partial_scan(&self, path: &str, failures: usize, classes: usize) {
        self.counters.partial_scan(path, failures, classes);
        self.inner.partial_scan(path, failures, classes);
    }

    fn cache_written(&self, path: &str, bytes: usize) {
        self.counters.cache_written(path, bytes);
        self.inner.cache_written(path, bytes);
    }

    fn cache_write_failed(&self, path: &str, reason: &str) {
        self.counters.cache_write_failed(path, reason);
        self.inner.cache_write_failed(path, reason);
    }

    fn cache_corrupt(&self, path: &str, reason: &str) {
        self.counters.cache_corrupt(path, reason);
        self.inner.cache_corrupt(path, reason);
    }

    fn invalidated(&self, path: &str) {
        self.counters.invalidated(path);
        self.inner.invalidated(path);
    }

    fn query(&self, kind: &str, target: &str, results: usize) {
        self.counters.query(kind, target, results);
        self.inner.query(kind, target, results);
    }
}
