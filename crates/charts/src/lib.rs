//! chartwatch charts: a work-queue cache of chart archive bytes.
//!
//! Repository indexing enqueues chart keys here; exactly one worker downloads
//! each archive once and stores it under
//! `helmcharts:<namespace>:<repo>/<chart>:<version>`. Deletes travel through
//! the same queue so they serialize with fetches of the same key.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use chartwatch_core::keys::{chart_key, chart_key_pattern_for_repo, parse_chart_key, ChartKey};
use chartwatch_core::{
    CacheError, CacheObserver, CacheResult, ChartBlob, ChartFetcher, ChartMetadata, ClientOptions, ItemOutcome,
    ResourceRef,
};
use chartwatch_queue::{QueueConfig, RateLimitingQueue};
use chartwatch_store::{get_value, set_value, Store};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ChartCacheConfig {
    pub name: String,
    pub max_retries: u32,
    pub queue: QueueConfig,
}

impl ChartCacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), max_retries: 5, queue: QueueConfig::default() }
    }
}

/// Work recorded for a queued key.
#[derive(Clone)]
enum Pending {
    Fetch { url: String, fetcher: Arc<dyn ChartFetcher>, options: ClientOptions },
    Delete,
}

struct Inner {
    cfg: ChartCacheConfig,
    store: Arc<dyn Store>,
    observer: Arc<dyn CacheObserver>,
    queue: RateLimitingQueue,
    pending: Mutex<FxHashMap<String, Pending>>,
    /// Keys whose work a worker has taken but not finished.
    in_flight: Mutex<FxHashSet<String>>,
    gate: RwLock<()>,
    resyncs_tx: watch::Sender<u64>,
}

pub struct ChartCache {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Download one archive, bypassing the queue.
pub async fn compute_value(fetcher: &dyn ChartFetcher, url: &str, options: &ClientOptions) -> Result<Vec<u8>> {
    let t0 = Instant::now();
    let bytes = fetcher.fetch(url, options).await.with_context(|| format!("fetching chart [{}]", url))?;
    metrics::histogram!("chart_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    metrics::counter!("chart_fetch_bytes_total", bytes.len() as u64);
    debug!(url = %url, bytes = bytes.len(), took_ms = %t0.elapsed().as_millis(), "chart fetched");
    Ok(bytes)
}

impl ChartCache {
    /// Create the cache and spawn its worker. Must run inside a tokio runtime.
    pub fn new(cfg: ChartCacheConfig, store: Arc<dyn Store>, observer: Arc<dyn CacheObserver>) -> Self {
        let queue = RateLimitingQueue::new(cfg.name.clone(), cfg.queue.clone());
        let (resyncs_tx, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            cfg,
            store,
            observer,
            queue,
            pending: Mutex::new(FxHashMap::default()),
            in_flight: Mutex::new(FxHashSet::default()),
            gate: RwLock::new(()),
            resyncs_tx,
        });
        let worker = tokio::spawn(Arc::clone(&inner).run_worker());
        info!(cache = %inner.cfg.name, "chart cache started");
        Self { inner, worker: Mutex::new(Some(worker)) }
    }

    pub fn name(&self) -> &str { &self.inner.cfg.name }

    pub fn key_for(&self, namespace: &str, chart_id: &str, version: &str) -> CacheResult<String> {
        chart_key(namespace, chart_id, version)
    }

    pub fn from_key(&self, key: &str) -> CacheResult<ChartKey> { parse_chart_key(key) }

    fn enqueue(&self, key: String, work: Pending) {
        lock(&self.inner.pending).insert(key.clone(), work);
        self.inner.queue.add(key);
    }

    /// Enqueue the newest version of every chart. Returns how many keys were enqueued.
    pub fn sync_charts(&self, charts: &[ChartMetadata], fetcher: Arc<dyn ChartFetcher>, options: &ClientOptions) -> usize {
        let mut n = 0;
        for chart in charts {
            let Some(latest) = chart.latest() else {
                warn!(chart = %chart.id, "skipping chart with no versions");
                continue;
            };
            let Some(url) = latest.download_url() else {
                warn!(chart = %chart.id, version = %latest.version, "chart version has no URLs");
                continue;
            };
            match chart_key(&chart.repo.namespace, &chart.id, &latest.version) {
                Ok(key) => {
                    let work = Pending::Fetch { url: url.to_string(), fetcher: Arc::clone(&fetcher), options: options.clone() };
                    self.enqueue(key, work);
                    n += 1;
                }
                Err(e) => error!(chart = %chart.id, error = %e, "cannot derive chart key"),
            }
        }
        debug!(cache = %self.name(), enqueued = n, of = charts.len(), "sync charts");
        n
    }

    /// Cached archive bytes, `None` on a miss. Never fetches.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match get_value::<ChartBlob>(&*self.inner.store, key).await {
            Ok(Some(v)) => v.map(|b| Some(b.0)),
            Ok(None) => Ok(None),
            Err(e) => Err(CacheError::Unavailable(format!("reading [{}]: {:#}", key, e))),
        }
    }

    /// Like `get`, but on a miss queue the fetch of that exact version, wait
    /// for it to settle and read again. `None` when `chart` has no such
    /// version or the version has no download URL.
    pub async fn get_or_fetch(
        &self,
        key: &str,
        chart: &ChartMetadata,
        fetcher: Arc<dyn ChartFetcher>,
        options: &ClientOptions,
    ) -> CacheResult<Option<Vec<u8>>> {
        if let Some(v) = self.get(key).await? {
            return Ok(Some(v));
        }
        let parsed = parse_chart_key(key)?;
        if parsed.namespace != chart.repo.namespace || parsed.chart_id != chart.id {
            return Err(CacheError::Internal(format!("unexpected state for chart with key [{}]", key)));
        }
        let Some(version) = chart.versions.iter().find(|v| v.version == parsed.version) else {
            return Ok(None);
        };
        let Some(url) = version.download_url() else {
            warn!(chart = %chart.id, version = %version.version, "chart version has no URLs");
            return Ok(None);
        };
        self.expect_add(key);
        self.enqueue(key.to_string(), Pending::Fetch { url: url.to_string(), fetcher, options: options.clone() });
        self.wait_until_forgotten(key).await;
        self.get(key).await
    }

    /// Keys owned by `repo`: stored, queued or being fetched.
    async fn keys_for_repo(&self, repo: &ResourceRef) -> Result<FxHashSet<String>> {
        let pattern = chart_key_pattern_for_repo(repo);
        let mut keys: FxHashSet<String> =
            self.inner.store.scan(&pattern).await.with_context(|| format!("scanning [{}]", pattern))?.into_iter().collect();
        let mut queued: Vec<String> = lock(&self.inner.pending).keys().cloned().collect();
        queued.extend(lock(&self.inner.in_flight).iter().cloned());
        for k in &queued {
            match parse_chart_key(k) {
                Ok(ck) if ck.namespace == repo.namespace && ck.repo_name() == Some(repo.name.as_str()) => {
                    keys.insert(k.clone());
                }
                Ok(_) => {}
                Err(e) => error!(key = %k, error = %e, "unexpected key in pending work"),
            }
        }
        Ok(keys)
    }

    /// Enqueue deletion of every chart key of `repo`. Returns the number of keys.
    pub async fn delete_charts_for_repo(&self, repo: &ResourceRef) -> Result<usize> {
        let keys = self.keys_for_repo(repo).await?;
        let n = keys.len();
        for k in keys {
            self.enqueue(k, Pending::Delete);
        }
        info!(cache = %self.name(), repo = %repo, keys = n, "deleting charts for repo");
        Ok(n)
    }

    /// Enqueue deletion of keys of `repo` whose chart id and version are not
    /// among `current`. Returns the number of keys.
    pub async fn purge_obsolete_chart_versions(&self, repo: &ResourceRef, current: &[ChartMetadata]) -> Result<usize> {
        let valid: FxHashSet<(&str, &str)> = current
            .iter()
            .flat_map(|c| c.versions.iter().map(move |v| (c.id.as_str(), v.version.as_str())))
            .collect();
        let mut n = 0;
        for k in self.keys_for_repo(repo).await? {
            let ck = parse_chart_key(&k)?;
            if !valid.contains(&(ck.chart_id.as_str(), ck.version.as_str())) {
                self.enqueue(k, Pending::Delete);
                n += 1;
            }
        }
        if n > 0 {
            info!(cache = %self.name(), repo = %repo, keys = n, "purging obsolete chart versions");
        }
        Ok(n)
    }

    /// Drop all queued work. Called by the owning repository cache right
    /// before it flushes the store.
    pub async fn on_resync(&self) {
        let _exclusive = self.inner.gate.write().await;
        self.inner.observer.resync_started(&self.inner.cfg.name, self.inner.queue.len());
        self.inner.queue.reset();
        lock(&self.inner.pending).clear();
        self.inner.resyncs_tx.send_modify(|n| *n += 1);
        self.inner.observer.resync_completed(&self.inner.cfg.name, 0);
    }

    pub fn expect_add(&self, key: &str) { self.inner.queue.expect_add(key) }

    pub async fn wait_until_forgotten(&self, key: &str) { self.inner.queue.wait_until_forgotten(key).await }

    pub async fn wait_until_idle(&self) { self.inner.queue.wait_until_idle().await }

    pub fn queue_len(&self) -> usize { self.inner.queue.len() }

    pub fn subscribe_resyncs(&self) -> watch::Receiver<u64> { self.inner.resyncs_tx.subscribe() }

    pub async fn shutdown(&self) {
        self.inner.queue.shut_down();
        let worker = lock(&self.worker).take();
        if let Some(w) = worker {
            if let Err(e) = w.await {
                warn!(cache = %self.name(), error = %e, "chart worker ended abnormally");
            }
        }
        info!(cache = %self.name(), "chart cache stopped");
    }
}

impl Inner {
    async fn apply(&self, key: &str, work: &Pending) -> Result<()> {
        match work {
            Pending::Delete => {
                let removed = self.store.delete(key).await.with_context(|| format!("deleting [{}]", key))?;
                info!(cache = %self.cfg.name, key = %key, removed, "chart deleted");
            }
            Pending::Fetch { url, fetcher, options } => {
                if self.store.exists(key).await.with_context(|| format!("checking [{}]", key))? {
                    debug!(cache = %self.cfg.name, key = %key, "already cached");
                    return Ok(());
                }
                let bytes = compute_value(&**fetcher, url, options).await?;
                let t0 = Instant::now();
                set_value(&*self.store, key, &ChartBlob(bytes)).await.with_context(|| format!("storing [{}]", key))?;
                info!(cache = %self.cfg.name, key = %key, took_ms = %t0.elapsed().as_millis(), "chart stored");
            }
        }
        Ok(())
    }

    async fn sync_key(&self, key: &str) -> Result<()> {
        let Some(work) = lock(&self.pending).remove(key) else {
            warn!(cache = %self.cfg.name, key = %key, "no pending work for key; skipping");
            return Ok(());
        };
        lock(&self.in_flight).insert(key.to_string());
        let res = self.apply(key, &work).await;
        lock(&self.in_flight).remove(key);
        if res.is_err() {
            // a newer entry wins over the failed one
            lock(&self.pending).entry(key.to_string()).or_insert(work);
        }
        res
    }

    async fn run_worker(self: Arc<Self>) {
        debug!(cache = %self.cfg.name, "chart worker started");
        while let Some(key) = self.queue.get().await {
            let gate = self.gate.read().await;
            if !self.queue.is_processing(&key) {
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
                        warn!(cache = %self.cfg.name, key = %key, retries_left = self.cfg.max_retries - n, error = %format!("{:#}", e), "chart sync failed; retrying");
                        self.queue.add_rate_limited(key.clone());
                        ItemOutcome::Retrying(n + 1)
                    } else {
                        error!(cache = %self.cfg.name, key = %key, error = %format!("{:#}", e), "chart sync failed; giving up");
                        self.queue.forget(&key);
                        lock(&self.pending).remove(&key);
                        ItemOutcome::GaveUp
                    }
                }
            };
            self.observer.item_done(&self.cfg.name, &key, outcome);
            self.queue.done(&key);
            drop(gate);
        }
        debug!(cache = %self.cfg.name, "chart worker stopped");
    }
}
