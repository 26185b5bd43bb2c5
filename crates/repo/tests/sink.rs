#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chartwatch_charts::{ChartCache, ChartCacheConfig};
use chartwatch_core::{CacheEntry, CacheError, ChartFetcher, NoopObserver, RepoKind, Resource};
use chartwatch_repo::oci::tags_checksum;
use chartwatch_repo::{HttpFetcher, OciClient, OciRegistry, RepoEventSink, REPO_KEY_PREFIX};
use chartwatch_store::MemoryStore;
use chartwatch_watch::EventSink;
use httpmock::prelude::*;
use serde_json::{json, Value};

const KEY: &str = "helmrepositories:default:bitnami";

const INDEX_V1: &str = r#"
apiVersion: v1
entries:
  redis:
  - name: redis
    version: 14.4.0
    appVersion: 6.2.4
    description: Open source in-memory store
    urls: [redis-14.4.0.tgz]
  - name: redis
    version: 14.3.4
    appVersion: 6.2.3
    urls: [redis-14.3.4.tgz]
"#;

const INDEX_V2: &str = r#"
apiVersion: v1
entries:
  redis:
  - name: redis
    version: 14.5.0
    urls: [redis-14.5.0.tgz]
  - name: redis
    version: 14.4.0
    urls: [redis-14.4.0.tgz]
"#;

struct Fixture {
    store: Arc<MemoryStore>,
    charts: Arc<ChartCache>,
    sink: RepoEventSink,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let charts = Arc::new(ChartCache::new(ChartCacheConfig::new("charts"), store.clone(), Arc::new(NoopObserver)));
    let http: Arc<dyn ChartFetcher> = Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap());
    let oci = OciClient::new(Duration::from_secs(5)).unwrap();
    let sink = RepoEventSink::new(REPO_KEY_PREFIX, Arc::clone(&charts), http, oci);
    Fixture { store, charts, sink }
}

fn helm_repo(name: &str, spec: Value, status: Value) -> Resource {
    Resource::from_raw(json!({
        "metadata": { "name": name, "namespace": "default", "generation": 1, "resourceVersion": "7" },
        "spec": spec,
        "status": status,
    }))
    .unwrap()
}

fn ready_status(checksum: &str, index_url: &str) -> Value {
    json!({
        "observedGeneration": 1,
        "conditions": [{ "type": "Ready", "status": "True", "reason": "Succeeded" }],
        "artifact": { "checksum": checksum, "url": index_url },
    })
}

async fn serve_charts(server: &MockServer) {
    for v in ["14.5.0", "14.4.0", "14.3.4"] {
        let path = format!("/charts/redis-{}.tgz", v);
        let body = format!("redis-{}", v);
        server
            .mock_async(|when, then| {
                when.method(GET).path(path.as_str());
                then.status(200).body(body.as_str());
            })
            .await;
    }
}

fn chart_key(version: &str) -> String { format!("helmcharts:default:bitnami/redis:{}", version) }

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_indexes_and_warms_latest_version() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path("/index.yaml");
            then.status(200).body(INDEX_V1);
        })
        .await;
    serve_charts(&server).await;
    let f = fixture();
    let repo = helm_repo("bitnami", json!({ "url": server.url("/charts") }), ready_status("c1", &server.url("/index.yaml")));

    f.charts.expect_add(&chart_key("14.4.0"));
    let entry = f.sink.on_add(KEY, &repo).await.unwrap().unwrap();
    f.charts.wait_until_forgotten(&chart_key("14.4.0")).await;

    assert_eq!(entry.checksum, "c1");
    assert_eq!(entry.kind, RepoKind::Default);
    assert_eq!(entry.charts.len(), 1);
    assert_eq!(entry.charts[0].id, "bitnami/redis");
    assert_eq!(entry.charts[0].versions[1].download_url(), Some(server.url("/charts/redis-14.3.4.tgz").as_str()));
    assert_eq!(index.hits_async().await, 1);

    assert_eq!(f.charts.get(&chart_key("14.4.0")).await.unwrap(), Some(b"redis-14.4.0".to_vec()));
    assert_eq!(f.charts.get(&chart_key("14.3.4")).await.unwrap(), None);
    f.charts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unready_and_failed_repositories() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path("/index.yaml");
            then.status(200).body(INDEX_V1);
        })
        .await;
    let f = fixture();

    let pending = helm_repo("bitnami", json!({ "url": server.url("/charts") }), json!({ "observedGeneration": 0 }));
    assert!(f.sink.on_add(KEY, &pending).await.unwrap().is_none());

    let failed = helm_repo(
        "bitnami",
        json!({ "url": server.url("/charts") }),
        json!({
            "observedGeneration": 1,
            "conditions": [{ "type": "Ready", "status": "False", "message": "failed to fetch Helm repository index" }],
        }),
    );
    let err = f.sink.on_add(KEY, &failed).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<CacheError>(), Some(CacheError::FailedPrecondition(m)) if m.contains("index")));

    let no_checksum = helm_repo(
        "bitnami",
        json!({ "url": server.url("/charts") }),
        json!({ "observedGeneration": 1, "conditions": [{ "type": "Ready", "status": "True" }] }),
    );
    assert!(f.sink.on_add(KEY, &no_checksum).await.is_err());
    assert_eq!(index.hits_async().await, 0);
    f.charts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modify_reindexes_only_on_checksum_change() {
    let server = MockServer::start_async().await;
    let v1 = server
        .mock_async(|when, then| {
            when.method(GET).path("/index.yaml");
            then.status(200).body(INDEX_V1);
        })
        .await;
    let v2 = server
        .mock_async(|when, then| {
            when.method(GET).path("/index-v2.yaml");
            then.status(200).body(INDEX_V2);
        })
        .await;
    serve_charts(&server).await;
    let f = fixture();
    let spec = json!({ "url": server.url("/charts") });
    let repo = helm_repo("bitnami", spec.clone(), ready_status("c1", &server.url("/index.yaml")));

    f.charts.expect_add(&chart_key("14.4.0"));
    let first = f.sink.on_add(KEY, &repo).await.unwrap().unwrap();
    f.charts.wait_until_forgotten(&chart_key("14.4.0")).await;

    // unchanged checksum: nothing fetched, nothing stored
    assert!(f.sink.on_modify(KEY, &repo, &first).await.unwrap().is_none());
    assert_eq!(v1.hits_async().await, 1);

    // warm the older version on demand so there is something to purge
    let http: Arc<dyn ChartFetcher> = Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap());
    let older = f.charts.get_or_fetch(&chart_key("14.3.4"), &first.charts[0], http, &Default::default()).await.unwrap();
    assert_eq!(older, Some(b"redis-14.3.4".to_vec()));

    let updated = helm_repo("bitnami", spec, ready_status("c2", &server.url("/index-v2.yaml")));
    f.charts.expect_add(&chart_key("14.5.0"));
    let second = f.sink.on_modify(KEY, &updated, &first).await.unwrap().unwrap();
    f.charts.wait_until_forgotten(&chart_key("14.5.0")).await;
    f.charts.wait_until_idle().await;

    assert_eq!(second.checksum, "c2");
    assert_eq!(v2.hits_async().await, 1);
    let keys: Vec<String> = f.store.snapshot().into_keys().collect();
    assert_eq!(keys, vec![chart_key("14.4.0"), chart_key("14.5.0")]);
    f.charts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_drops_repository_charts() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/index.yaml");
            then.status(200).body(INDEX_V1);
        })
        .await;
    serve_charts(&server).await;
    let f = fixture();
    let repo = helm_repo("bitnami", json!({ "url": server.url("/charts") }), ready_status("c1", &server.url("/index.yaml")));

    f.charts.expect_add(&chart_key("14.4.0"));
    f.sink.on_add(KEY, &repo).await.unwrap();
    f.charts.wait_until_forgotten(&chart_key("14.4.0")).await;
    assert_eq!(f.store.len(), 1);

    assert!(f.sink.on_delete(KEY).await.unwrap());
    f.charts.wait_until_idle().await;
    assert!(f.store.is_empty());
    assert!(f.sink.on_delete("helmrepositories:default").await.is_err());
    f.charts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_clears_chart_queue() {
    let f = fixture();
    let mut epochs = f.charts.subscribe_resyncs();
    f.sink.on_resync().await.unwrap();
    epochs.changed().await.unwrap();
    assert_eq!(*epochs.borrow(), 1);
    assert_eq!(f.charts.queue_len(), 0);
    f.charts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oci_repository_through_docker_v2() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v2.0/ping");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/");
            then.status(200).header("Docker-Distribution-Api-Version", "registry/2.0");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/_catalog");
            then.status(200).header("content-type", "application/json").json_body(json!({ "repositories": ["stefanprodan/podinfo"] }));
        })
        .await;
    let tags = server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/stefanprodan/podinfo/tags/list");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "name": "stefanprodan/podinfo", "tags": ["6.0.3", "6.1.0"] }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/stefanprodan/podinfo/manifests/6.1.0");
            then.status(200).header("Docker-Content-Digest", "sha256:manifest").json_body(json!({
                "schemaVersion": 2,
                "config": { "mediaType": "application/vnd.cncf.helm.config.v1+json", "digest": "sha256:cfg" },
                "layers": [{ "mediaType": "application/vnd.cncf.helm.chart.content.v1.tar+gzip", "digest": "sha256:layer" }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/stefanprodan/podinfo/blobs/sha256:cfg");
            then.status(200).json_body(json!({
                "name": "podinfo",
                "version": "6.1.0",
                "appVersion": "6.1.0",
                "description": "Podinfo Helm chart for Kubernetes",
                "home": "https://github.com/stefanprodan/podinfo",
                "maintainers": [{ "name": "stefanprodan", "email": "stefanprodan@users.noreply.github.com" }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/stefanprodan/podinfo/blobs/sha256:layer");
            then.status(200).body("podinfo-6.1.0.tgz");
        })
        .await;

    let f = fixture();
    let repo = helm_repo(
        "podinfo",
        json!({ "url": format!("oci://{}/stefanprodan", server.address()), "type": "oci", "insecure": true }),
        json!({ "observedGeneration": 1, "conditions": [{ "type": "Ready", "status": "True" }] }),
    );
    let key = "helmrepositories:default:podinfo";
    let latest = "helmcharts:default:podinfo/podinfo:6.1.0";

    f.charts.expect_add(latest);
    let entry: CacheEntry = f.sink.on_add(key, &repo).await.unwrap().unwrap();
    f.charts.wait_until_forgotten(latest).await;

    let mut expected = BTreeMap::new();
    expected.insert("podinfo".to_string(), vec!["6.0.3".to_string(), "6.1.0".to_string()]);
    assert_eq!(entry.kind, RepoKind::Oci);
    assert_eq!(entry.checksum, tags_checksum(&expected));
    let chart = &entry.charts[0];
    assert_eq!(chart.id, "podinfo/podinfo");
    assert_eq!(chart.description, "Podinfo Helm chart for Kubernetes");
    let versions: Vec<&str> = chart.versions.iter().map(|v| v.version.as_str()).collect();
    assert_eq!(versions, vec!["6.1.0", "6.0.3"]);
    assert_eq!(chart.versions[0].digest, "sha256:manifest");
    assert_eq!(
        chart.versions[0].download_url(),
        Some(format!("oci://{}/stefanprodan/podinfo:6.1.0", server.address()).as_str())
    );
    let registry = OciRegistry::parse(&format!("oci://{}/stefanprodan", server.address()), true).unwrap();
    assert_eq!(f.sink.listers().selected(&registry), Some("docker-registry-v2"));
    assert_eq!(f.charts.get(latest).await.unwrap(), Some(b"podinfo-6.1.0.tgz".to_vec()));

    // same names and tags: no re-indexing
    assert!(f.sink.on_modify(key, &repo, &entry).await.unwrap().is_none());
    assert_eq!(tags.hits_async().await, 2);
    f.charts.shutdown().await;
}
