//! Repository index parsing.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use chartwatch_core::{ChartMetadata, ChartVersion, Maintainer, ResourceRef};
use serde::Deserialize;
use smallvec::SmallVec;
use tracing::{debug, warn};
use url::Url;

/// Turns an index document into chart records, versions newest first.
pub trait Indexer: Send + Sync {
    fn index(&self, repo: &ResourceRef, repo_url: &str, bytes: &[u8]) -> Result<Vec<ChartMetadata>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IndexEntry {
    name: String,
    version: String,
    app_version: String,
    description: String,
    home: String,
    icon: String,
    keywords: Vec<String>,
    maintainers: Vec<IndexMaintainer>,
    urls: Vec<String>,
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndexMaintainer {
    name: String,
    email: Option<String>,
    url: Option<String>,
}

/// Helm `index.yaml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelmIndexer;

impl HelmIndexer {
    /// Absolute URLs pass through; relative ones are joined onto the repository URL.
    fn resolve(base: Option<&Url>, raw: &str) -> Result<String> {
        match Url::parse(raw) {
            Ok(u) => Ok(u.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = base.ok_or_else(|| anyhow!("relative chart URL [{}] without a repository URL", raw))?;
                Ok(base.join(raw).with_context(|| format!("resolving [{}]", raw))?.to_string())
            }
            Err(e) => Err(anyhow!("invalid chart URL [{}]: {}", raw, e)),
        }
    }
}

impl Indexer for HelmIndexer {
    fn index(&self, repo: &ResourceRef, repo_url: &str, bytes: &[u8]) -> Result<Vec<ChartMetadata>> {
        let file: IndexFile = serde_yaml::from_slice(bytes).context("parsing index.yaml")?;
        if file.api_version.is_empty() {
            bail!("index.yaml of {} has no API version", repo);
        }
        let base = if repo_url.is_empty() {
            None
        } else {
            let mut s = repo_url.to_string();
            if !s.ends_with('/') {
                s.push('/');
            }
            Some(Url::parse(&s).with_context(|| format!("repository URL [{}]", repo_url))?)
        };

        let mut charts = Vec::with_capacity(file.entries.len());
        for (name, entries) in file.entries {
            if entries.is_empty() {
                continue;
            }
            let mut chart = ChartMetadata::new(repo.clone(), name.clone());
            for e in &entries {
                if e.name != name {
                    warn!(repo = %repo, entry = %name, name = %e.name, "index entry name mismatch");
                }
                let mut urls = SmallVec::new();
                for u in &e.urls {
                    urls.push(Self::resolve(base.as_ref(), u)?);
                }
                chart.versions.push(ChartVersion {
                    version: e.version.clone(),
                    app_version: e.app_version.clone(),
                    digest: e.digest.clone(),
                    urls,
                });
            }
            chart.sort_versions();
            // descriptive fields follow the newest version
            let newest = chart
                .latest()
                .and_then(|v| entries.iter().find(|e| e.version == v.version))
                .unwrap_or(&entries[0]);
            chart.description = newest.description.clone();
            chart.home = newest.home.clone();
            chart.icon = newest.icon.clone();
            chart.keywords = newest.keywords.clone();
            chart.maintainers = newest
                .maintainers
                .iter()
                .map(|m| Maintainer { name: m.name.clone(), email: m.email.clone(), url: m.url.clone() })
                .collect();
            charts.push(chart);
        }
        debug!(repo = %repo, charts = charts.len(), "index parsed");
        Ok(charts)
    }
}
