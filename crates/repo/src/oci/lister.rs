use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chartwatch_core::{CacheError, ClientOptions};
use reqwest::{header, Response, StatusCode};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{OciClient, OciRegistry};

/// A vendor dialect for enumerating the repositories of a registry.
#[async_trait]
pub trait OciRepositoryLister: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(false)` means the registry does not speak this dialect.
    async fn is_applicable_for(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<bool>;

    /// Full repository names, including the registry path.
    async fn list_repository_names(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<Vec<String>>;
}

#[derive(Deserialize)]
struct HarborErrors {
    #[serde(default)]
    errors: Vec<HarborError>,
}

#[derive(Deserialize)]
struct HarborError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct HarborRepo {
    name: String,
}

async fn harbor_error(resp: Response) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<HarborErrors>(&body).ok().filter(|e| !e.errors.is_empty());
    match parsed {
        Some(e) => {
            let msgs: Vec<String> = e
                .errors
                .iter()
                .map(|e| {
                    let code = e.code.replace('_', " ").to_lowercase();
                    if e.message.is_empty() {
                        code
                    } else {
                        format!("{}: {}", code, e.message)
                    }
                })
                .collect();
            anyhow!("harbor: {} ({})", msgs.join("; "), status)
        }
        None => anyhow!("harbor: unexpected status {}", status),
    }
}

/// Harbor API v2.0: `/api/v2.0/ping`, then the project named by the first
/// path segment, then its repositories page by page.
pub struct HarborLister {
    page_size: usize,
}

impl Default for HarborLister {
    fn default() -> Self { Self { page_size: 10 } }
}

impl HarborLister {
    pub fn with_page_size(page_size: usize) -> Self { Self { page_size: page_size.max(1) } }

    fn project<'a>(&self, reg: &'a OciRegistry) -> Result<&'a str> {
        reg.project().ok_or_else(|| anyhow!("registry URL {} names no harbor project", reg))
    }
}

#[async_trait]
impl OciRepositoryLister for HarborLister {
    fn name(&self) -> &'static str { "harbor-v2" }

    async fn is_applicable_for(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<bool> {
        let Some(project) = reg.project() else {
            return Ok(false);
        };
        let resp = client.get(&reg.endpoint("/api/v2.0/ping"), None, options).await?;
        match resp.status() {
            StatusCode::OK => {
                let pong = resp.text().await.unwrap_or_default();
                debug!(registry = %reg, pong = %pong.trim(), "harbor ping");
            }
            StatusCode::NOT_FOUND => return Ok(false),
            _ => return Err(harbor_error(resp).await),
        }
        let resp = client.get(&reg.endpoint(&format!("/api/v2.0/projects/{}", project)), None, options).await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::FORBIDDEN => bail!("harbor project [{}] on {}: forbidden", project, reg.host()),
            _ => Err(harbor_error(resp).await),
        }
    }

    async fn list_repository_names(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<Vec<String>> {
        let project = self.project(reg)?;
        let mut names = Vec::new();
        for page in 1.. {
            let url = reg.endpoint(&format!(
                "/api/v2.0/projects/{}/repositories?page={}&page_size={}",
                project, page, self.page_size
            ));
            let resp = client.get(&url, None, options).await?;
            if resp.status() != StatusCode::OK {
                return Err(harbor_error(resp).await);
            }
            let ct = resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
            if !ct.starts_with("application/json") {
                bail!("unexpected response content type: [{}]", ct);
            }
            let repos: Vec<HarborRepo> = resp.json().await.with_context(|| format!("decoding page {} of {}", page, project))?;
            let n = repos.len();
            names.extend(repos.into_iter().map(|r| r.name));
            if n < self.page_size {
                break;
            }
        }
        debug!(registry = %reg, repositories = names.len(), "harbor listing");
        Ok(names)
    }
}

#[derive(Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

/// `<url>; rel="next"` target of a Link header.
fn next_link(resp: &Response) -> Option<String> {
    let v = resp.headers().get(header::LINK)?.to_str().ok()?;
    v.split(',').find(|part| part.contains("rel=\"next\"")).and_then(|part| {
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        (start < end).then(|| part[start..end].to_string())
    })
}

/// Generic Docker Registry HTTP API v2: `GET /v2/` check, `/v2/_catalog` listing.
pub struct DockerV2Lister {
    page_size: usize,
}

impl Default for DockerV2Lister {
    fn default() -> Self { Self { page_size: 100 } }
}

impl DockerV2Lister {
    pub fn with_page_size(page_size: usize) -> Self { Self { page_size: page_size.max(1) } }
}

#[async_trait]
impl OciRepositoryLister for DockerV2Lister {
    fn name(&self) -> &'static str { "docker-registry-v2" }

    async fn is_applicable_for(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<bool> {
        let resp = client.get(&reg.endpoint("/v2/"), None, options).await?;
        let version = resp.headers().get("docker-distribution-api-version").and_then(|v| v.to_str().ok()).unwrap_or_default();
        let speaks_v2 = version.trim() == "registry/2.0";
        match resp.status() {
            // 401 still identifies the dialect; listing reports the auth problem
            StatusCode::OK | StatusCode::UNAUTHORIZED => Ok(speaks_v2),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("probing {}: unexpected status {}", reg.endpoint("/v2/"), s),
        }
    }

    async fn list_repository_names(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut url = reg.endpoint(&format!("/v2/_catalog?n={}", self.page_size));
        loop {
            let resp = client.get(&url, None, options).await?;
            if resp.status() != StatusCode::OK {
                bail!("listing catalog of {}: {}", reg.host(), resp.status());
            }
            let next = next_link(&resp);
            let page: Catalog = resp.json().await.with_context(|| format!("decoding catalog of {}", reg.host()))?;
            let empty = page.repositories.is_empty();
            names.extend(page.repositories);
            match next {
                Some(n) if !empty => url = if n.starts_with('/') { reg.endpoint(&n) } else { n },
                _ => break,
            }
        }
        // the catalog spans the whole registry; keep what lives under the path
        if !reg.path().is_empty() {
            names.retain(|n| reg.chart_name(n).is_some());
        }
        debug!(registry = %reg, repositories = names.len(), "catalog listing");
        Ok(names)
    }
}

enum Selection {
    Selected(Arc<dyn OciRepositoryLister>),
    Failed(String),
}

/// Picks and remembers a lister per registry. Candidates are tried in
/// order; the first applicable one is bound. A registry every candidate
/// declined is remembered as failed. An applicability error leaves the
/// registry unselected so the next call tries again.
pub struct ListerSelector {
    candidates: Vec<Arc<dyn OciRepositoryLister>>,
    memo: Mutex<FxHashMap<String, Selection>>,
}

impl Default for ListerSelector {
    fn default() -> Self { Self::new(vec![Arc::new(HarborLister::default()), Arc::new(DockerV2Lister::default())]) }
}

impl ListerSelector {
    pub fn new(candidates: Vec<Arc<dyn OciRepositoryLister>>) -> Self { Self { candidates, memo: Mutex::new(FxHashMap::default()) } }

    fn memo(&self) -> MutexGuard<'_, FxHashMap<String, Selection>> { self.memo.lock().unwrap_or_else(PoisonError::into_inner) }

    fn memo_key(reg: &OciRegistry) -> String { format!("{}|{}", reg, reg.plain_http()) }

    /// Name of the bound lister, if any.
    pub fn selected(&self, reg: &OciRegistry) -> Option<&'static str> {
        match self.memo().get(&Self::memo_key(reg)) {
            Some(Selection::Selected(l)) => Some(l.name()),
            _ => None,
        }
    }

    /// Drop what is remembered about `reg`.
    pub fn forget(&self, reg: &OciRegistry) { self.memo().remove(&Self::memo_key(reg)); }

    pub async fn select(&self, client: &OciClient, reg: &OciRegistry, options: &ClientOptions) -> Result<Arc<dyn OciRepositoryLister>> {
        let key = Self::memo_key(reg);
        match self.memo().get(&key) {
            Some(Selection::Selected(l)) => return Ok(Arc::clone(l)),
            Some(Selection::Failed(msg)) => return Err(anyhow!(CacheError::Unsupported(msg.clone()))),
            None => {}
        }

        let mut check_errors = Vec::new();
        for c in &self.candidates {
            match c.is_applicable_for(client, reg, options).await {
                Ok(true) => {
                    info!(registry = %reg, lister = c.name(), "oci lister selected");
                    metrics::counter!("oci_lister_selected_total", 1u64, "lister" => c.name());
                    self.memo().insert(key, Selection::Selected(Arc::clone(c)));
                    return Ok(Arc::clone(c));
                }
                Ok(false) => debug!(registry = %reg, lister = c.name(), "oci lister not applicable"),
                Err(e) => {
                    warn!(registry = %reg, lister = c.name(), error = %format!("{:#}", e), "oci lister applicability check failed");
                    check_errors.push(format!("{}: {:#}", c.name(), e));
                }
            }
        }

        if check_errors.is_empty() {
            let msg = format!("no applicable repository lister found for registry {}", reg);
            self.memo().insert(key, Selection::Failed(msg.clone()));
            Err(anyhow!(CacheError::Unsupported(msg)))
        } else {
            Err(anyhow!("selecting a repository lister for {}: {}", reg, check_errors.join("; ")))
        }
    }
}
