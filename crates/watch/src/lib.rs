//! chartwatch watch: keeps an external store consistent with a listed and
//! watched resource collection.
//!
//! One watch loop per cache turns stream events into queue items; one worker
//! applies them through an [`EventSink`]. When the stream reports its token
//! as expired the loop performs a full resync: drain the queue, flush the
//! store, list, repopulate, resume watching from the new token.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chartwatch_core::keys::{parse_resource_key, resource_key};
use chartwatch_core::{CacheObserver, CacheResult, CacheValue, Resource, ResourceRef, ResourceSource};
use chartwatch_queue::QueueConfig;
use chartwatch_store::Store;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod engine;

use engine::Inner;

/// Transform callbacks binding the engine to one resource kind.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    type Value: CacheValue;

    /// Value to store for a resource seen for the first time, `None` to store nothing.
    async fn on_add(&self, key: &str, resource: &Resource) -> Result<Option<Self::Value>>;

    /// Value to store for a resource with an existing cached value, `None`
    /// to leave the store untouched.
    async fn on_modify(&self, key: &str, resource: &Resource, old: &Self::Value) -> Result<Option<Self::Value>>;

    /// Called when the resource is gone. Return `true` to remove the cached value.
    async fn on_delete(&self, key: &str) -> Result<bool>;

    /// Called during a resync, before the store is flushed.
    async fn on_resync(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WatcherCacheConfig {
    /// Used in logs, metrics and the queue name.
    pub name: String,
    /// First key segment, usually the resource plural.
    pub key_prefix: String,
    pub max_retries: u32,
    /// Resync attempts before the bootstrap gives up (later resyncs keep trying).
    pub max_resync_attempts: u32,
    pub resync_backoff_base: Duration,
    pub populate_concurrency: usize,
    pub reconnect_backoff_max: Duration,
    pub queue: QueueConfig,
}

impl WatcherCacheConfig {
    pub fn new(name: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            max_retries: 5,
            max_resync_attempts: 2,
            resync_backoff_base: Duration::from_secs(1),
            populate_concurrency: 10,
            reconnect_backoff_max: Duration::from_secs(30),
            queue: QueueConfig::default(),
        }
    }
}

pub struct WatcherCache<S: EventSink> {
    inner: Arc<Inner<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: EventSink> WatcherCache<S> {
    /// Bootstrap the store with a full list, then start the worker and the
    /// watch loop. Fails if the bootstrap list cannot be completed.
    pub async fn start(
        cfg: WatcherCacheConfig,
        source: Arc<dyn ResourceSource>,
        store: Arc<dyn Store>,
        sink: Arc<S>,
        observer: Arc<dyn CacheObserver>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner::new(cfg, source, store, sink, observer));
        let mut shutdown = inner.subscribe_shutdown();
        let token = match inner.resync_retrying(true, &mut shutdown).await? {
            Some(t) => t,
            None => anyhow::bail!("shut down during bootstrap"),
        };
        let worker = tokio::spawn(Arc::clone(&inner).run_worker());
        let watcher = tokio::spawn(Arc::clone(&inner).run_watch_loop(token));
        info!(cache = %inner.cfg.name, "watcher cache started");
        Ok(Self { inner, tasks: Mutex::new(vec![worker, watcher]) })
    }

    pub fn name(&self) -> &str { &self.inner.cfg.name }

    pub fn key_for(&self, reference: &ResourceRef) -> CacheResult<String> {
        resource_key(&self.inner.cfg.key_prefix, reference)
    }

    pub fn from_key(&self, key: &str) -> CacheResult<ResourceRef> { parse_resource_key(&self.inner.cfg.key_prefix, key) }

    /// Read the cached value without recomputing on a miss.
    pub async fn fetch(&self, key: &str) -> CacheResult<Option<S::Value>> { self.inner.fetch(key).await }

    /// Read the cached value; on a miss (or an unreadable store) have the
    /// worker recompute it from the source and read again.
    pub async fn get(&self, key: &str) -> CacheResult<Option<S::Value>> {
        self.from_key(key)?;
        match self.inner.fetch(key).await {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) => warn!(cache = %self.name(), key = %key, error = %e, "store read failed; recomputing"),
        }
        self.inner.force_and_fetch(key).await
    }

    /// `get` for several keys, at most `populate_concurrency` at a time.
    pub async fn get_multiple(&self, keys: &[String]) -> CacheResult<HashMap<String, Option<S::Value>>> {
        let conc = self.inner.cfg.populate_concurrency.max(1);
        let results: Vec<(String, CacheResult<Option<S::Value>>)> = futures::stream::iter(keys.iter().cloned())
            .map(|k| async move {
                let r = self.get(&k).await;
                (k, r)
            })
            .buffer_unordered(conc)
            .collect()
            .await;
        let mut out = HashMap::with_capacity(results.len());
        for (k, r) in results {
            out.insert(k, r?);
        }
        Ok(out)
    }

    /// Announce that `key` is about to be processed; pair with `wait_until_forgotten`.
    pub fn expect_add(&self, key: &str) { self.inner.queue.expect_add(key) }

    /// Block until `key` has no pending, queued or in-flight work.
    pub async fn wait_until_forgotten(&self, key: &str) { self.inner.queue.wait_until_forgotten(key).await }

    /// Ask the watch loop to perform a full resync as if the stream had been invalidated.
    pub fn request_resync(&self) { self.inner.resync_req.notify_one() }

    /// Number of completed resyncs, bootstrap included.
    pub fn subscribe_resyncs(&self) -> watch::Receiver<u64> { self.inner.resyncs_tx.subscribe() }

    /// Stop the watch loop and the worker and wait for both.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.queue.shut_down();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(cache = %self.name(), error = %e, "cache task ended abnormally");
            }
        }
        info!(cache = %self.name(), "watcher cache stopped");
    }
}
