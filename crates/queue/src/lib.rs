//! chartwatch queue: a keyed FIFO work queue with per-key exponential backoff.
//!
//! Semantics:
//! - a key that is already waiting collapses into the existing entry (`dirty`);
//! - a key handed out by `get` is `processing` until `done`; re-adding it in the
//!   meantime marks it dirty and it is re-queued by `done`, so no two workers
//!   ever hold the same key;
//! - `expect_add` registers interest in a key ahead of the actual `add`, which
//!   lets `wait_until_forgotten` block across the gap between a failure and its
//!   delayed retry.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000) }
    }
}

impl QueueConfig {
    /// Delay before the `(failures + 1)`-th retry: `base * 2^failures`, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(factor).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    expected: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    shutting_down: bool,
}

impl State {
    fn settled(&self, key: &str) -> bool {
        !(self.expected.contains(key) || self.dirty.contains(key) || self.processing.contains(key))
    }
}

struct Inner {
    name: String,
    cfg: QueueConfig,
    state: Mutex<State>,
    changed: Notify,
}

/// Cloning yields another handle onto the same queue.
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<Inner>,
}

impl RateLimitingQueue {
    pub fn new(name: impl Into<String>, cfg: QueueConfig) -> Self {
        let name = name.into();
        debug!(queue = %name, ?cfg, "queue created");
        Self { inner: Arc::new(Inner { name, cfg, state: Mutex::new(State::default()), changed: Notify::new() }) }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(&self, st: &State) {
        metrics::gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
    }

    /// Enqueue `key` unless it is already waiting. Clears a pending `expect_add`.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.expected.remove(&key);
            if !st.dirty.insert(key.clone()) {
                return;
            }
            if !st.processing.contains(&key) {
                st.queue.push_back(key);
                metrics::counter!("workqueue_adds_total", 1u64, "queue" => self.inner.name.clone());
            }
            self.publish_depth(&st);
        }
        self.inner.changed.notify_waiters();
    }

    /// Enqueue `key` after `delay`. The key counts as expected in the meantime.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        self.expect_add(&key);
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Re-enqueue `key` with its per-key backoff and bump its failure count.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.cfg.backoff(*n);
            *n += 1;
            delay
        };
        metrics::counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        debug!(queue = %self.inner.name, key = %key, delay_ms = %delay.as_millis(), "rate limited add");
        self.add_after(key, delay);
    }

    /// Block until a key is available. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    self.publish_depth(&st);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer processing; re-queue it if it was re-added meanwhile.
    /// A no-op for keys that are not processing, such as ones handed out before
    /// a `reset`.
    pub fn done(&self, key: &str) {
        {
            let mut st = self.lock();
            if st.shutting_down || !st.processing.remove(key) {
                return;
            }
            if st.dirty.contains(key) {
                st.queue.push_back(key.to_string());
                self.publish_depth(&st);
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Clear the backoff state of `key`.
    pub fn forget(&self, key: &str) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &str) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_processing(&self, key: &str) -> bool {
        let st = self.lock();
        !st.shutting_down && st.processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Announce that `key` is about to be added.
    pub fn expect_add(&self, key: &str) {
        let mut st = self.lock();
        if !st.shutting_down {
            st.expected.insert(key.to_string());
        }
    }

    /// Wait until `key` is neither expected, waiting nor processing.
    pub async fn wait_until_forgotten(&self, key: &str) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.shutting_down || st.settled(key) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Wait until nothing is queued and nothing is processing.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.shutting_down || (st.queue.is_empty() && st.processing.is_empty()) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Drop waiting and processing keys and all backoff state. Expected keys
    /// are kept: their adds are still coming.
    pub fn reset(&self) {
        {
            let mut st = self.lock();
            info!(queue = %self.inner.name, queued = st.queue.len(), processing = st.processing.len(), "queue reset");
            st.queue.clear();
            st.dirty.clear();
            st.processing.clear();
            st.failures.clear();
            self.publish_depth(&st);
        }
        self.inner.changed.notify_waiters();
    }

    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            debug!(
                queue = %self.inner.name,
                expected = st.expected.len(),
                dirty = st.dirty.len(),
                processing = st.processing.len(),
                queued = st.queue.len(),
                "queue shut down"
            );
        }
        self.inner.changed.notify_waiters();
    }
}
