use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chartwatch_core::keys::{parse_resource_key, resource_key};
use chartwatch_core::{
    CacheError, CacheObserver, CacheResult, DeltaKind, ItemOutcome, Resource, ResourceSource, ResyncToken, WatchEvent,
};
use chartwatch_queue::RateLimitingQueue;
use chartwatch_store::{get_value, set_value, Store};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::{EventSink, WatcherCacheConfig};

/// Latest observed state for a queued key.
enum Pending {
    Upsert(Resource),
    Delete,
}

pub(crate) struct Inner<S: EventSink> {
    pub(crate) cfg: WatcherCacheConfig,
    source: Arc<dyn ResourceSource>,
    store: Arc<dyn Store>,
    sink: Arc<S>,
    observer: Arc<dyn CacheObserver>,
    pub(crate) queue: RateLimitingQueue,
    pending: Mutex<FxHashMap<String, Pending>>,
    /// Last transform failure per key, reported by `force_and_fetch`.
    failures: Mutex<FxHashMap<String, CacheError>>,
    /// Worker holds it shared per item, resync holds it exclusively.
    gate: RwLock<()>,
    pub(crate) resync_req: Notify,
    pub(crate) resyncs_tx: watch::Sender<u64>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Sleep for `d` unless shutdown is signalled first. `false` on shutdown.
async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        _ = shutdown.changed() => false,
    }
}

impl<S: EventSink> Inner<S> {
    pub(crate) fn new(
        cfg: WatcherCacheConfig,
        source: Arc<dyn ResourceSource>,
        store: Arc<dyn Store>,
        sink: Arc<S>,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        let queue = RateLimitingQueue::new(cfg.name.clone(), cfg.queue.clone());
        let (resyncs_tx, _) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cfg,
            source,
            store,
            sink,
            observer,
            queue,
            pending: Mutex::new(FxHashMap::default()),
            failures: Mutex::new(FxHashMap::default()),
            gate: RwLock::new(()),
            resync_req: Notify::new(),
            resyncs_tx,
            shutdown_tx,
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> { self.shutdown_tx.subscribe() }

    fn key_for(&self, resource: &Resource) -> CacheResult<String> {
        resource_key(&self.cfg.key_prefix, &resource.reference)
    }

    pub(crate) async fn fetch(&self, key: &str) -> CacheResult<Option<S::Value>> {
        match get_value::<S::Value>(&*self.store, key).await {
            Ok(Some(v)) => v.map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(CacheError::Unavailable(format!("reading [{}]: {:#}", key, e))),
        }
    }

    /// Sync `key` now and read the result. A resync that drops the queued key
    /// mid-flight would leave a flushed store behind, so when the resync epoch
    /// moves the sync is redone once after the resync completes.
    pub(crate) async fn force_and_fetch(&self, key: &str) -> CacheResult<Option<S::Value>> {
        let mut epoch = *self.resyncs_tx.borrow();
        let mut retried = false;
        loop {
            self.queue.expect_add(key);
            self.queue.add(key);
            self.queue.wait_until_forgotten(key).await;
            // blocks while a resync holds the gate
            let _shared = self.gate.read().await;
            let now = *self.resyncs_tx.borrow();
            if now != epoch && !retried {
                debug!(cache = %self.cfg.name, key = %key, epoch = now, "resync overlapped forced sync; retrying");
                epoch = now;
                retried = true;
                continue;
            }
            if let Some(e) = lock(&self.failures).get(key).cloned() {
                return Err(e);
            }
            return self.fetch(key).await;
        }
    }

    fn enqueue(&self, kind: DeltaKind, resource: Resource) {
        let key = match self.key_for(&resource) {
            Ok(k) => k,
            Err(e) => {
                warn!(cache = %self.cfg.name, resource = %resource.reference, error = %e, "cannot derive key; event skipped");
                return;
            }
        };
        debug!(cache = %self.cfg.name, key = %key, ?kind, "event");
        metrics::counter!("watcher_events_total", 1u64, "cache" => self.cfg.name.clone());
        let p = match kind {
            DeltaKind::Deleted => Pending::Delete,
            DeltaKind::Added | DeltaKind::Modified => Pending::Upsert(resource),
        };
        lock(&self.pending).insert(key.clone(), p);
        self.queue.add(key);
    }

    /// Run the transform for one resource and store the result. Returns
    /// whether a value was written. Transform failures are absorbed: the
    /// stale value (if any) is removed and `Ok(false)` is returned.
    async fn add_or_modify(&self, key: &str, resource: &Resource, check_old: bool) -> Result<bool> {
        let old = if check_old {
            match get_value::<S::Value>(&*self.store, key).await.with_context(|| format!("reading [{}]", key))? {
                Some(Ok(v)) => Some(v),
                Some(Err(e)) => {
                    warn!(cache = %self.cfg.name, key = %key, error = %e, "cached value unreadable; treating as absent");
                    None
                }
                None => None,
            }
        } else {
            None
        };

        let (op, result) = match &old {
            None => ("on_add", self.sink.on_add(key, resource).await),
            Some(o) => ("on_modify", self.sink.on_modify(key, resource, o).await),
        };

        match result {
            Err(e) => {
                error!(cache = %self.cfg.name, key = %key, op, error = %format!("{:#}", e), "transform failed; dropping cached value");
                lock(&self.failures).insert(key.to_string(), CacheError::from(e));
                match self.store.delete(key).await {
                    Ok(removed) => debug!(key = %key, removed, "stale value deleted"),
                    Err(e2) => error!(key = %key, error = %e2, "failed to delete stale value"),
                }
                Ok(false)
            }
            Ok(Some(value)) => {
                let t0 = Instant::now();
                set_value(&*self.store, key, &value).await.with_context(|| format!("storing [{}]", key))?;
                lock(&self.failures).remove(key);
                info!(cache = %self.cfg.name, key = %key, op, took_ms = %t0.elapsed().as_millis(), "stored");
                Ok(true)
            }
            Ok(None) => {
                lock(&self.failures).remove(key);
                debug!(cache = %self.cfg.name, key = %key, op, "nothing to store");
                Ok(false)
            }
        }
    }

    async fn on_delete(&self, key: &str) -> Result<()> {
        let remove = self.sink.on_delete(key).await.with_context(|| format!("on_delete [{}]", key))?;
        if remove {
            let removed = self.store.delete(key).await.with_context(|| format!("deleting [{}]", key))?;
            info!(cache = %self.cfg.name, key = %key, removed, "deleted");
        }
        lock(&self.failures).remove(key);
        Ok(())
    }

    async fn sync_key(&self, key: &str) -> Result<()> {
        let reference = parse_resource_key(&self.cfg.key_prefix, key)?;
        let taken = lock(&self.pending).remove(key);
        let res = match &taken {
            Some(Pending::Delete) => self.on_delete(key).await,
            Some(Pending::Upsert(r)) => self.add_or_modify(key, r, true).await.map(|_| ()),
            None => match self.source.get(&reference).await.with_context(|| format!("getting {}", reference))? {
                Some(r) => self.add_or_modify(key, &r, true).await.map(|_| ()),
                None => self.on_delete(key).await,
            },
        };
        if res.is_err() {
            if let Some(p) = taken {
                // keep whatever arrived while we were working
                lock(&self.pending).entry(key.to_string()).or_insert(p);
            }
        }
        res
    }

    pub(crate) async fn run_worker(self: Arc<Self>) {
        debug!(cache = %self.cfg.name, "worker started");
        while let Some(key) = self.queue.get().await {
            let gate = self.gate.read().await;
            if !self.queue.is_processing(&key) {
                // dropped by a resync while we waited for the gate
                debug!(cache = %self.cfg.name, key = %key, "item reset; skipping");
                continue;
            }
            let outcome = match self.sync_key(&key).await {
                Ok(()) => {
                    self.queue.forget(&key);
                    ItemOutcome::Synced
                }
                Err(e) => {
                    let n = self.queue.num_requeues(&key);
                    if !CacheError::is_permanent_any(&e) && n < self.cfg.max_retries {
                        warn!(cache = %self.cfg.name, key = %key, attempt = n + 1, error = %format!("{:#}", e), "sync failed; retrying");
                        self.queue.add_rate_limited(key.clone());
                        ItemOutcome::Retrying(n + 1)
                    } else {
                        error!(cache = %self.cfg.name, key = %key, error = %format!("{:#}", e), "sync failed; giving up");
                        self.queue.forget(&key);
                        lock(&self.pending).remove(&key);
                        ItemOutcome::GaveUp
                    }
                }
            };
            // report before `done` so settle waiters observe the outcome
            self.observer.item_done(&self.cfg.name, &key, outcome);
            self.queue.done(&key);
            drop(gate);
        }
        debug!(cache = %self.cfg.name, "worker stopped");
    }

    async fn populate(&self, resources: Vec<Resource>) -> usize {
        let conc = self.cfg.populate_concurrency.max(1);
        futures::stream::iter(resources)
            .map(|r| async move {
                let key = match self.key_for(&r) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(cache = %self.cfg.name, resource = %r.reference, error = %e, "cannot derive key; skipped");
                        return false;
                    }
                };
                match self.add_or_modify(&key, &r, false).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!(cache = %self.cfg.name, key = %key, error = %format!("{:#}", e), "populate failed");
                        false
                    }
                }
            })
            .buffer_unordered(conc)
            .fold(0usize, |n, stored| async move { n + usize::from(stored) })
            .await
    }

    /// Flush the store and rebuild it from a fresh list. Outside bootstrap the
    /// queue is drained first and dependents are told through `on_resync`.
    async fn resync(&self, bootstrap: bool) -> Result<ResyncToken> {
        let t0 = Instant::now();
        info!(cache = %self.cfg.name, bootstrap, queued = self.queue.len(), "resync starting");
        if !bootstrap {
            self.queue.wait_until_idle().await;
        }
        let _exclusive = self.gate.write().await;
        self.observer.resync_started(&self.cfg.name, self.queue.len());

        if !bootstrap {
            self.queue.reset();
            lock(&self.pending).clear();
            self.sink.on_resync().await.context("on_resync")?;
        }
        lock(&self.failures).clear();

        self.store.flush().await.context("flushing store")?;
        let (items, token) = self.source.list().await.context("listing resources")?;
        if token.0.is_empty() {
            return Err(anyhow!(CacheError::Internal("list response carries no resync token".into())));
        }
        let listed = items.len();
        let stored = self.populate(items).await;

        self.resyncs_tx.send_modify(|n| *n += 1);
        self.observer.resync_completed(&self.cfg.name, stored);
        metrics::counter!("watcher_resyncs_total", 1u64, "cache" => self.cfg.name.clone());
        metrics::histogram!("watcher_resync_ms", t0.elapsed().as_secs_f64() * 1000.0, "cache" => self.cfg.name.clone());
        info!(cache = %self.cfg.name, listed, stored, token = %token, took_ms = %t0.elapsed().as_millis(), "resync complete");
        Ok(token)
    }

    /// Retry resync with exponential backoff. Bootstrap gives up after
    /// `max_resync_attempts`; later resyncs keep going until shutdown.
    pub(crate) async fn resync_retrying(
        &self,
        bootstrap: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<ResyncToken>> {
        let mut attempt: u32 = 0;
        loop {
            match self.resync(bootstrap).await {
                Ok(t) => return Ok(Some(t)),
                Err(e) => {
                    attempt += 1;
                    metrics::counter!("watcher_resync_failures_total", 1u64, "cache" => self.cfg.name.clone());
                    if bootstrap && attempt >= self.cfg.max_resync_attempts {
                        return Err(e.context(format!("bootstrap of [{}] failed after {} attempts", self.cfg.name, attempt)));
                    }
                    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                    let wait = self
                        .cfg
                        .resync_backoff_base
                        .checked_mul(factor)
                        .map_or(self.cfg.reconnect_backoff_max, |d| d.min(self.cfg.reconnect_backoff_max));
                    warn!(cache = %self.cfg.name, attempt, wait_ms = %wait.as_millis(), error = %format!("{:#}", e), "resync failed");
                    if !sleep_or_shutdown(wait, shutdown).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub(crate) async fn run_watch_loop(self: Arc<Self>, mut token: ResyncToken) {
        let mut shutdown = self.subscribe_shutdown();
        let backoff_min = Duration::from_millis(250);
        let mut backoff = backoff_min;
        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            let opened = tokio::select! {
                r = self.source.watch(&token) => r,
                _ = shutdown.changed() => break 'outer,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) => {
                    warn!(cache = %self.cfg.name, token = %token, error = %format!("{:#}", e), "watch open failed");
                    if !sleep_or_shutdown(backoff, &mut shutdown).await {
                        break 'outer;
                    }
                    backoff = (backoff * 2).min(self.cfg.reconnect_backoff_max);
                    continue;
                }
            };
            debug!(cache = %self.cfg.name, token = %token, "watching");

            let mut resync_needed = false;
            let mut failed = false;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    _ = self.resync_req.notified() => {
                        info!(cache = %self.cfg.name, "resync requested");
                        resync_needed = true;
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(WatchEvent::Bookmark(t))) => {
                            backoff = backoff_min;
                            token = t;
                        }
                        Some(Ok(WatchEvent::Invalidated)) => {
                            info!(cache = %self.cfg.name, token = %token, "watch invalidated");
                            resync_needed = true;
                            break;
                        }
                        Some(Ok(ev)) => {
                            backoff = backoff_min;
                            if let Some((kind, resource)) = ev.delta() {
                                if let Some(rv) = resource.resource_version.clone() {
                                    token = ResyncToken(rv);
                                }
                                self.enqueue(kind, resource);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(cache = %self.cfg.name, error = %format!("{:#}", e), "watch stream error");
                            failed = true;
                            break;
                        }
                        None => {
                            debug!(cache = %self.cfg.name, "watch stream ended; reconnecting");
                            break;
                        }
                    }
                }
            }
            drop(stream);

            if resync_needed {
                match self.resync_retrying(false, &mut shutdown).await {
                    Ok(Some(t)) => {
                        token = t;
                        backoff = backoff_min;
                    }
                    Ok(None) => break 'outer,
                    Err(e) => {
                        error!(cache = %self.cfg.name, error = %format!("{:#}", e), "resync abandoned");
                        break 'outer;
                    }
                }
            } else if failed {
                if !sleep_or_shutdown(backoff, &mut shutdown).await {
                    break 'outer;
                }
                backoff = (backoff * 2).min(self.cfg.reconnect_backoff_max);
            }
        }
        info!(cache = %self.cfg.name, "watch loop stopped");
    }
}
