#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chartwatch_charts::{compute_value, ChartCache, ChartCacheConfig};
use chartwatch_core::{
    CacheError, CacheObserver, ChartFetcher, ChartMetadata, ChartVersion, ClientOptions, ItemOutcome, ResourceRef,
};
use chartwatch_store::{MemoryStore, StoreOp};
use smallvec::smallvec;

#[derive(Default)]
struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    fail_first: AtomicUsize,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingFetcher {
    fn calls(&self, url: &str) -> usize { self.calls.lock().unwrap().get(url).copied().unwrap_or(0) }
    fn total(&self) -> usize { self.calls.lock().unwrap().values().sum() }
}

#[async_trait::async_trait]
impl ChartFetcher for CountingFetcher {
    async fn fetch(&self, url: &str, _options: &ClientOptions) -> Result<Vec<u8>> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let left = self.fail_first.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_first.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("502 bad gateway"));
        }
        Ok(format!("tgz:{}", url).into_bytes())
    }
}

#[derive(Default)]
struct Recorder {
    outcomes: Mutex<Vec<(String, ItemOutcome)>>,
}

impl CacheObserver for Recorder {
    fn item_done(&self, _cache: &str, key: &str, outcome: ItemOutcome) {
        self.outcomes.lock().unwrap().push((key.to_string(), outcome));
    }
}

fn url(repo: &str, name: &str, v: &str) -> String { format!("https://charts.example.com/{}/{}-{}.tgz", repo, name, v) }

fn chart(repo: &str, name: &str, versions: &[&str]) -> ChartMetadata {
    let mut c = ChartMetadata::new(ResourceRef::new("default", repo), name);
    c.versions = versions
        .iter()
        .map(|v| ChartVersion {
            version: v.to_string(),
            app_version: "7.0".into(),
            digest: String::new(),
            urls: smallvec![url(repo, name, v)],
        })
        .collect();
    c
}

fn cache_with(store: Arc<MemoryStore>, observer: Arc<Recorder>) -> ChartCache {
    ChartCache::new(ChartCacheConfig::new("charts"), store, observer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_syncs_fetch_once() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(cache_with(store.clone(), Arc::new(Recorder::default())));
    let fetcher = Arc::new(CountingFetcher::default());
    fetcher.delay_ms.store(20, Ordering::SeqCst);
    let charts = vec![chart("bitnami", "redis", &["14.4.0", "14.3.4"])];
    let key = cache.key_for("default", "bitnami/redis", "14.4.0").unwrap();

    cache.expect_add(&key);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        let charts = charts.clone();
        let fetcher: Arc<dyn ChartFetcher> = fetcher.clone();
        handles.push(tokio::spawn(async move { cache.sync_charts(&charts, fetcher, &ClientOptions::default()) }));
    }
    for h in futures::future::join_all(handles).await {
        assert_eq!(h.unwrap(), 1);
    }
    cache.wait_until_forgotten(&key).await;
    cache.wait_until_idle().await;

    assert_eq!(fetcher.calls(&url("bitnami", "redis", "14.4.0")), 1);
    assert_eq!(fetcher.total(), 1);
    assert_eq!(store.len(), 1);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn distinct_keys_are_fetched_one_at_a_time() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher = Arc::new(CountingFetcher::default());
    fetcher.delay_ms.store(15, Ordering::SeqCst);
    let charts: Vec<_> =
        ["redis", "mysql", "nginx", "kafka", "etcd"].iter().map(|n| chart("bitnami", n, &["1.0.0"])).collect();

    assert_eq!(cache.sync_charts(&charts, fetcher.clone(), &ClientOptions::default()), 5);
    cache.wait_until_idle().await;

    assert_eq!(fetcher.total(), 5);
    assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 5);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn latest_warmed_older_fetched_on_demand() {
    let store = Arc::new(MemoryStore::with_journal());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher = Arc::new(CountingFetcher::default());
    let redis = chart("bitnami", "redis", &["14.4.0", "14.3.4"]);
    let latest = cache.key_for("default", "bitnami/redis", "14.4.0").unwrap();
    let older = cache.key_for("default", "bitnami/redis", "14.3.4").unwrap();

    cache.expect_add(&latest);
    cache.sync_charts(std::slice::from_ref(&redis), fetcher.clone(), &ClientOptions::default());
    cache.wait_until_forgotten(&latest).await;

    let bytes = cache.get(&latest).await.unwrap().unwrap();
    assert_eq!(bytes, format!("tgz:{}", url("bitnami", "redis", "14.4.0")).into_bytes());
    assert!(cache.get(&older).await.unwrap().is_none());

    store.clear_ops();
    let bytes = cache.get_or_fetch(&older, &redis, fetcher.clone(), &ClientOptions::default()).await.unwrap().unwrap();
    assert_eq!(bytes, format!("tgz:{}", url("bitnami", "redis", "14.3.4")).into_bytes());
    assert_eq!(
        store.ops(),
        vec![StoreOp::Get(older.clone()), StoreOp::Exists(older.clone()), StoreOp::Set(older.clone()), StoreOp::Get(older.clone())]
    );
    assert_eq!(fetcher.total(), 2);

    // a version the chart does not list is a plain miss
    let unknown = cache.key_for("default", "bitnami/redis", "1.0.0").unwrap();
    assert!(cache.get_or_fetch(&unknown, &redis, fetcher.clone(), &ClientOptions::default()).await.unwrap().is_none());
    // a key for another chart is rejected
    let other = cache.key_for("default", "bitnami/apache", "1.0.0").unwrap();
    let err = cache.get_or_fetch(&other, &redis, fetcher.clone(), &ClientOptions::default()).await.unwrap_err();
    assert!(matches!(err, CacheError::Internal(_)));
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_is_a_miss_then_refetch() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher = Arc::new(CountingFetcher::default());
    let redis = chart("bitnami", "redis", &["14.4.0"]);
    let key = cache.key_for("default", "bitnami/redis", "14.4.0").unwrap();

    cache.expect_add(&key);
    cache.sync_charts(std::slice::from_ref(&redis), fetcher.clone(), &ClientOptions::default());
    cache.wait_until_forgotten(&key).await;
    assert!(store.evict(&key));

    assert!(cache.get(&key).await.unwrap().is_none());
    let bytes = cache.get_or_fetch(&key, &redis, fetcher.clone(), &ClientOptions::default()).await.unwrap();
    assert!(bytes.is_some());
    assert_eq!(fetcher.total(), 2);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_retry_and_persistent_give_up() {
    let store = Arc::new(MemoryStore::new());
    let observer = Arc::new(Recorder::default());
    let cache = cache_with(store.clone(), observer.clone());

    let flaky = Arc::new(CountingFetcher::default());
    flaky.fail_first.store(2, Ordering::SeqCst);
    let redis = chart("bitnami", "redis", &["14.4.0"]);
    let key = cache.key_for("default", "bitnami/redis", "14.4.0").unwrap();
    cache.expect_add(&key);
    cache.sync_charts(std::slice::from_ref(&redis), flaky.clone(), &ClientOptions::default());
    cache.wait_until_forgotten(&key).await;
    assert!(cache.get(&key).await.unwrap().is_some());
    assert_eq!(flaky.total(), 3);

    let broken = Arc::new(CountingFetcher::default());
    broken.fail_first.store(usize::MAX, Ordering::SeqCst);
    let apache = chart("bitnami", "apache", &["9.0.0"]);
    let key = cache.key_for("default", "bitnami/apache", "9.0.0").unwrap();
    cache.expect_add(&key);
    cache.sync_charts(std::slice::from_ref(&apache), broken.clone(), &ClientOptions::default());
    cache.wait_until_forgotten(&key).await;
    assert!(cache.get(&key).await.unwrap().is_none());
    assert_eq!(broken.total(), 6);
    assert!(observer.outcomes.lock().unwrap().contains(&(key.clone(), ItemOutcome::GaveUp)));
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_for_repo_covers_stored_and_queued() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher = Arc::new(CountingFetcher::default());
    let opts = ClientOptions::default();

    let other = chart("other", "nginx", &["1.0.0"]);
    let stored = chart("bitnami", "redis", &["14.4.0"]);
    let other_key = cache.key_for("default", "other/nginx", "1.0.0").unwrap();
    let stored_key = cache.key_for("default", "bitnami/redis", "14.4.0").unwrap();
    cache.expect_add(&other_key);
    cache.expect_add(&stored_key);
    cache.sync_charts(&[other, stored], fetcher.clone(), &opts);
    cache.wait_until_forgotten(&other_key).await;
    cache.wait_until_forgotten(&stored_key).await;
    assert_eq!(store.len(), 2);

    // one slow fetch in flight, one more queued behind it
    fetcher.delay_ms.store(100, Ordering::SeqCst);
    let slow = chart("bitnami", "apache", &["9.0.0"]);
    let queued = chart("bitnami", "mysql", &["8.0.0"]);
    cache.sync_charts(&[slow, queued], fetcher.clone(), &opts);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let n = cache.delete_charts_for_repo(&ResourceRef::new("default", "bitnami")).await.unwrap();
    assert_eq!(n, 3);
    cache.wait_until_idle().await;

    let keys: Vec<String> = store.snapshot().into_keys().collect();
    assert_eq!(keys, vec![other_key]);
    assert_eq!(fetcher.calls(&url("bitnami", "mysql", "8.0.0")), 0);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purge_drops_versions_no_longer_indexed() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher: Arc<dyn ChartFetcher> = Arc::new(CountingFetcher::default());
    let opts = ClientOptions::default();
    let before = chart("bitnami", "redis", &["14.4.0", "14.3.4"]);
    for v in ["14.4.0", "14.3.4"] {
        let k = cache.key_for("default", "bitnami/redis", v).unwrap();
        cache.get_or_fetch(&k, &before, Arc::clone(&fetcher), &opts).await.unwrap().unwrap();
    }
    assert_eq!(store.len(), 2);

    let after = chart("bitnami", "redis", &["14.5.0", "14.4.0"]);
    let repo = ResourceRef::new("default", "bitnami");
    assert_eq!(cache.purge_obsolete_chart_versions(&repo, std::slice::from_ref(&after)).await.unwrap(), 1);
    cache.wait_until_idle().await;

    let keys: Vec<String> = store.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["helmcharts:default:bitnami/redis:14.4.0".to_string()]);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_drops_queued_work() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(Recorder::default()));
    let fetcher = Arc::new(CountingFetcher::default());
    fetcher.delay_ms.store(50, Ordering::SeqCst);
    let charts: Vec<ChartMetadata> = (0..4).map(|i| chart("bitnami", &format!("c{}", i), &["1.0.0"])).collect();
    cache.sync_charts(&charts, fetcher.clone(), &ClientOptions::default());
    tokio::time::sleep(Duration::from_millis(10)).await;

    cache.on_resync().await;
    assert_eq!(cache.queue_len(), 0);
    assert_eq!(*cache.subscribe_resyncs().borrow(), 1);
    cache.wait_until_idle().await;
    // only the fetch already in flight completed
    assert!(fetcher.total() <= 1);
    assert!(store.len() <= 1);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compute_value_bypasses_queue() {
    let fetcher = CountingFetcher::default();
    let bytes = compute_value(&fetcher, "https://x/y.tgz", &ClientOptions::default()).await.unwrap();
    assert_eq!(bytes, b"tgz:https://x/y.tgz".to_vec());
    assert_eq!(fetcher.total(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn from_key_rejects_malformed() {
    let cache = cache_with(Arc::new(MemoryStore::new()), Arc::new(Recorder::default()));
    let k = cache.from_key("helmcharts:default:bitnami/redis:14.4.0").unwrap();
    assert_eq!(k.chart_id, "bitnami/redis");
    assert!(matches!(cache.from_key("helmcharts:default:bitnami/redis"), Err(CacheError::Internal(_))));
    assert!(cache.key_for("default", "", "1").is_err());
    cache.shutdown().await;
}
