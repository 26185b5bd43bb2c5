use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chartwatch_charts::ChartCache;
use chartwatch_core::keys::parse_resource_key;
use chartwatch_core::{
    AuthResolver, CacheEntry, CacheError, ChartFetcher, ChartMetadata, ChartVersion, ClientOptions, Maintainer, RepoKind,
    Resource,
};
use chartwatch_watch::EventSink;
use smallvec::smallvec;
use tracing::{debug, info, warn};

use crate::auth::StaticAuth;
use crate::helmrepo::{self, Readiness};
use crate::index::{HelmIndexer, Indexer};
use crate::oci::{tags_checksum, ListerSelector, OciClient, OciFetcher, OciRegistry};

/// What a repository looks like right now, cheap enough to compare
/// against the cached checksum before any indexing happens.
enum Snapshot {
    Index { checksum: String },
    Oci { checksum: String, registry: OciRegistry, tags: BTreeMap<String, Vec<String>> },
}

impl Snapshot {
    fn checksum(&self) -> &str {
        match self {
            Snapshot::Index { checksum } | Snapshot::Oci { checksum, .. } => checksum,
        }
    }

    fn kind(&self) -> RepoKind {
        match self {
            Snapshot::Index { .. } => RepoKind::Default,
            Snapshot::Oci { .. } => RepoKind::Oci,
        }
    }
}

/// Binds the watch engine to HelmRepository objects: indexes ready
/// repositories into a [`CacheEntry`] and keeps the chart cache in step.
pub struct RepoEventSink {
    key_prefix: String,
    charts: Arc<ChartCache>,
    http: Arc<dyn ChartFetcher>,
    oci_fetcher: Arc<dyn ChartFetcher>,
    indexer: Arc<dyn Indexer>,
    auth: Arc<dyn AuthResolver>,
    oci: OciClient,
    listers: ListerSelector,
}

impl RepoEventSink {
    pub fn new(key_prefix: impl Into<String>, charts: Arc<ChartCache>, http: Arc<dyn ChartFetcher>, oci: OciClient) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            charts,
            http,
            oci_fetcher: Arc::new(OciFetcher::new(oci.clone())),
            indexer: Arc::new(HelmIndexer),
            auth: Arc::new(StaticAuth::default()),
            oci,
            listers: ListerSelector::default(),
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthResolver>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_listers(mut self, listers: ListerSelector) -> Self {
        self.listers = listers;
        self
    }

    pub fn listers(&self) -> &ListerSelector { &self.listers }

    async fn options_for(&self, repo: &Resource) -> Result<ClientOptions> {
        let mut opts = self.auth.options_for(repo).await.with_context(|| format!("resolving credentials for {}", repo.reference))?;
        if helmrepo::is_oci(repo) {
            opts.plain_http = helmrepo::is_insecure(repo);
        }
        Ok(opts)
    }

    async fn snapshot(&self, repo: &Resource, options: &ClientOptions) -> Result<Snapshot> {
        if helmrepo::is_oci(repo) {
            return self.oci_snapshot(repo, options).await;
        }
        let checksum = helmrepo::checksum(repo).ok_or_else(|| {
            anyhow!(CacheError::FailedPrecondition(format!(
                "expected field status.artifact.checksum not found on HelmRepository {}",
                repo.reference
            )))
        })?;
        Ok(Snapshot::Index { checksum: checksum.to_string() })
    }

    /// Lists chart repositories and their tags; the checksum covers names and tags only.
    async fn oci_snapshot(&self, repo: &Resource, options: &ClientOptions) -> Result<Snapshot> {
        let url = helmrepo::repo_url(repo)
            .ok_or_else(|| anyhow!(CacheError::FailedPrecondition(format!("HelmRepository {} has no spec.url", repo.reference))))?;
        let registry = OciRegistry::parse(url, options.plain_http)?;
        let lister = self.listers.select(&self.oci, &registry, options).await?;
        let names = lister.list_repository_names(&self.oci, &registry, options).await?;

        let mut tags = BTreeMap::new();
        for full in &names {
            let Some(chart) = registry.chart_name(full) else {
                debug!(registry = %registry, repository = %full, "outside registry path; skipped");
                continue;
            };
            let t = self.oci.tags(&registry, full, options).await?;
            if t.is_empty() {
                debug!(registry = %registry, repository = %full, "no tags; skipped");
                continue;
            }
            tags.insert(chart.to_string(), t);
        }
        Ok(Snapshot::Oci { checksum: tags_checksum(&tags), registry, tags })
    }

    async fn oci_chart(
        &self,
        repo: &Resource,
        registry: &OciRegistry,
        name: &str,
        tags: &[String],
        options: &ClientOptions,
    ) -> ChartMetadata {
        let mut chart = ChartMetadata::new(repo.reference.clone(), name);
        chart.versions = tags
            .iter()
            .map(|t| ChartVersion {
                version: t.clone(),
                app_version: String::new(),
                digest: String::new(),
                urls: smallvec![registry.chart_ref(name, t)],
            })
            .collect();
        chart.sort_versions();
        let Some(latest) = chart.versions.first().map(|v| v.version.clone()) else {
            return chart;
        };
        match self.oci.chart_config(registry, &registry.repository(name), &latest, options).await {
            Ok((cfg, digest)) => {
                chart.description = cfg.description;
                chart.home = cfg.home;
                chart.icon = cfg.icon;
                chart.keywords = cfg.keywords;
                chart.maintainers =
                    cfg.maintainers.into_iter().map(|m| Maintainer { name: m.name, email: m.email, url: m.url }).collect();
                if let Some(v) = chart.versions.first_mut() {
                    v.app_version = cfg.app_version;
                    v.digest = digest.unwrap_or_default();
                }
            }
            Err(e) => warn!(chart = %chart.id, tag = %latest, error = %format!("{:#}", e), "chart details unavailable"),
        }
        chart
    }

    async fn charts_for(&self, repo: &Resource, snapshot: &Snapshot, options: &ClientOptions) -> Result<Vec<ChartMetadata>> {
        match snapshot {
            Snapshot::Index { .. } => {
                let url = helmrepo::index_url(repo).ok_or_else(|| {
                    anyhow!(CacheError::FailedPrecondition(format!(
                        "expected field status.artifact.url not found on HelmRepository {}",
                        repo.reference
                    )))
                })?;
                let bytes = self.http.fetch(url, options).await.with_context(|| format!("fetching index of {}", repo.reference))?;
                self.indexer.index(&repo.reference, helmrepo::repo_url(repo).unwrap_or_default(), &bytes)
            }
            Snapshot::Oci { registry, tags, .. } => {
                let mut charts = Vec::with_capacity(tags.len());
                for (name, t) in tags {
                    charts.push(self.oci_chart(repo, registry, name, t, options).await);
                }
                Ok(charts)
            }
        }
    }

    /// Index `repo` unless its checksum matches `previous`. Obsolete chart
    /// versions are purged before the new ones are queued.
    async fn index(&self, repo: &Resource, previous: Option<&CacheEntry>) -> Result<Option<CacheEntry>> {
        let t0 = Instant::now();
        let options = self.options_for(repo).await?;
        let snapshot = self.snapshot(repo, &options).await?;
        if let Some(prev) = previous {
            if prev.checksum == snapshot.checksum() {
                debug!(repo = %repo.reference, checksum = %prev.checksum, "checksum unchanged; not re-indexing");
                return Ok(None);
            }
        }
        let charts = self.charts_for(repo, &snapshot, &options).await?;
        if previous.is_some() {
            self.charts.purge_obsolete_chart_versions(&repo.reference, &charts).await?;
        }
        let fetcher = match snapshot.kind() {
            RepoKind::Default => Arc::clone(&self.http),
            RepoKind::Oci => Arc::clone(&self.oci_fetcher),
        };
        let queued = self.charts.sync_charts(&charts, fetcher, &options);
        metrics::counter!("repo_indexed_total", 1u64, "kind" => snapshot.kind().to_string());
        info!(
            repo = %repo.reference,
            kind = %snapshot.kind(),
            charts = charts.len(),
            queued,
            took_ms = %t0.elapsed().as_millis(),
            "repository indexed"
        );
        Ok(Some(CacheEntry { checksum: snapshot.checksum().to_string(), charts, kind: snapshot.kind() }))
    }

    fn ready(&self, key: &str, repo: &Resource) -> Result<bool> {
        match helmrepo::readiness(repo) {
            Readiness::Ready => Ok(true),
            Readiness::NotReady => {
                info!(key = %key, "repository not ready; skipping");
                Ok(false)
            }
            Readiness::Failed(msg) => Err(anyhow!(CacheError::FailedPrecondition(msg))),
        }
    }
}

#[async_trait]
impl EventSink for RepoEventSink {
    type Value = CacheEntry;

    async fn on_add(&self, key: &str, resource: &Resource) -> Result<Option<CacheEntry>> {
        if !self.ready(key, resource)? {
            return Ok(None);
        }
        self.index(resource, None).await
    }

    async fn on_modify(&self, key: &str, resource: &Resource, old: &CacheEntry) -> Result<Option<CacheEntry>> {
        if !self.ready(key, resource)? {
            return Ok(None);
        }
        self.index(resource, Some(old)).await
    }

    async fn on_delete(&self, key: &str) -> Result<bool> {
        let reference = parse_resource_key(&self.key_prefix, key)?;
        self.charts.delete_charts_for_repo(&reference).await?;
        Ok(true)
    }

    async fn on_resync(&self) -> Result<()> {
        self.charts.on_resync().await;
        Ok(())
    }
}
