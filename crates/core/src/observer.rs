//! Notification hooks for work-item completion and resync progress.
//!
//! Caches call these on every processed item and around every resync. The
//! default methods do nothing, so an implementation only overrides what it
//! cares about (metrics, test synchronisation, audit logging).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Processed successfully and forgotten by the queue.
    Synced,
    /// Failed; re-queued with backoff. Carries the number of requeues so far.
    Retrying(u32),
    /// Failed permanently or exhausted its retries; dropped.
    GaveUp,
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemOutcome::Synced => f.write_str("synced"),
            ItemOutcome::Retrying(_) => f.write_str("retrying"),
            ItemOutcome::GaveUp => f.write_str("gave_up"),
        }
    }
}

pub trait CacheObserver: Send + Sync {
    fn item_done(&self, _cache: &str, _key: &str, _outcome: ItemOutcome) {}
    /// Resync is about to flush the store. `backlog` is the queue length
    /// observed once in-flight work drained (always 0 for a well-behaved queue).
    fn resync_started(&self, _cache: &str, _backlog: usize) {}
    fn resync_completed(&self, _cache: &str, _entries: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}

/// Publishes hook calls through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl CacheObserver for MetricsObserver {
    fn item_done(&self, cache: &str, _key: &str, outcome: ItemOutcome) {
        metrics::counter!("cache_items_total", 1u64, "cache" => cache.to_string(), "outcome" => outcome.to_string());
    }

    fn resync_started(&self, cache: &str, backlog: usize) {
        metrics::counter!("cache_resyncs_started_total", 1u64, "cache" => cache.to_string());
        metrics::gauge!("cache_resync_backlog", backlog as f64, "cache" => cache.to_string());
    }

    fn resync_completed(&self, cache: &str, entries: usize) {
        metrics::counter!("cache_resyncs_completed_total", 1u64, "cache" => cache.to_string());
        metrics::gauge!("cache_resync_entries", entries as f64, "cache" => cache.to_string());
    }
}
