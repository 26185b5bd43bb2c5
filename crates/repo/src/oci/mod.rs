//! OCI registry access: registry references, tag listing, manifest and
//! blob pulls, and the fetcher used for `oci://` chart locators.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chartwatch_core::{ChartFetcher, ClientOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::http::{with_options, ClientPool};

mod lister;

pub use lister::{DockerV2Lister, HarborLister, ListerSelector, OciRepositoryLister};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const HELM_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.helm.config.v1+json";
pub const HELM_CHART_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// A registry location as written in a repository's `spec.url`:
/// `oci://host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciRegistry {
    host: String,
    path: String,
    plain_http: bool,
}

impl OciRegistry {
    pub fn parse(raw: &str, plain_http: bool) -> Result<Self> {
        let u = Url::parse(raw.trim()).with_context(|| format!("invalid registry URL [{}]", raw))?;
        if u.scheme() != "oci" {
            bail!("registry URL [{}] must use the oci scheme", raw);
        }
        let host = u.host_str().filter(|h| !h.is_empty()).ok_or_else(|| anyhow!("registry URL [{}] has no host", raw))?;
        let host = match u.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        Ok(Self { host, path: u.path().trim_matches('/').to_string(), plain_http })
    }

    pub fn host(&self) -> &str { &self.host }

    /// Path under the host, e.g. the Harbor project. May be empty.
    pub fn path(&self) -> &str { &self.path }

    pub fn plain_http(&self) -> bool { self.plain_http }

    /// First path segment.
    pub fn project(&self) -> Option<&str> { self.path.split('/').next().filter(|s| !s.is_empty()) }

    /// `http(s)://host` followed by `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}://{}{}", if self.plain_http { "http" } else { "https" }, self.host, path)
    }

    /// Full repository name of `chart` inside this registry.
    pub fn repository(&self, chart: &str) -> String {
        if self.path.is_empty() {
            chart.to_string()
        } else {
            format!("{}/{}", self.path, chart)
        }
    }

    /// Chart name for a full repository name, `None` if it lives outside `path`.
    pub fn chart_name<'a>(&self, repository: &'a str) -> Option<&'a str> {
        if self.path.is_empty() {
            return Some(repository);
        }
        repository.strip_prefix(self.path.as_str())?.strip_prefix('/').filter(|s| !s.is_empty())
    }

    pub fn chart_ref(&self, chart: &str, tag: &str) -> String { format!("oci://{}/{}:{}", self.host, self.repository(chart), tag) }
}

impl fmt::Display for OciRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oci://{}/{}", self.host, self.path)
    }
}

/// A parsed `oci://host/repository:tag` locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRef {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ChartRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix("oci://").ok_or_else(|| anyhow!("not an oci locator: [{}]", raw))?;
        let (host, path) = rest.split_once('/').ok_or_else(|| anyhow!("oci locator [{}] has no repository", raw))?;
        let (repository, tag) = path.rsplit_once(':').ok_or_else(|| anyhow!("oci locator [{}] has no tag", raw))?;
        if host.is_empty() || repository.is_empty() || tag.is_empty() || repository.contains(':') {
            bail!("malformed oci locator [{}]", raw);
        }
        Ok(Self { host: host.to_string(), repository: repository.to_string(), tag: tag.to_string() })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Chart.yaml as carried in the helm config blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartConfig {
    pub name: String,
    pub version: String,
    pub app_version: String,
    pub description: String,
    pub home: String,
    pub icon: String,
    pub keywords: Vec<String>,
    pub maintainers: Vec<ConfigMaintainer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigMaintainer {
    pub name: String,
    pub email: Option<String>,
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

static CHALLENGE_PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
fn bearer_challenge(value: &str) -> Option<BTreeMap<String, String>> {
    let rest = value.trim().strip_prefix("Bearer ")?;
    let params: BTreeMap<String, String> =
        CHALLENGE_PARAM_RE.captures_iter(rest).map(|c| (c[1].to_ascii_lowercase(), c[2].to_string())).collect();
    params.contains_key("realm").then_some(params)
}

/// sha256 over sorted `name:tag,tag` lines. A tag re-pushed under the same
/// name does not change it.
pub fn tags_checksum(tags: &BTreeMap<String, Vec<String>>) -> String {
    let mut h = Sha256::new();
    for (name, t) in tags {
        let mut t = t.clone();
        t.sort();
        h.update(format!("{}:{}\n", name, t.join(",")).as_bytes());
    }
    hex::encode(h.finalize())
}

/// Thin registry client over reqwest. Handles the bearer token dance on 401.
#[derive(Clone)]
pub struct OciClient {
    clients: ClientPool,
}

impl OciClient {
    pub fn new(timeout: Duration) -> Result<Self> { Ok(Self { clients: ClientPool::new(timeout)? }) }

    /// GET `url`, exchanging credentials for a bearer token once if challenged.
    pub async fn get(&self, url: &str, accept: Option<&str>, options: &ClientOptions) -> Result<Response> {
        let http = self.clients.client(options)?;
        let build = |opts: &ClientOptions| {
            let mut req = with_options(http.get(url), opts);
            if let Some(a) = accept {
                req = req.header(header::ACCEPT, a);
            }
            req
        };
        let resp = build(options).send().await.with_context(|| format!("GET {}", url))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let Some(challenge) =
            resp.headers().get(header::WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()).and_then(bearer_challenge)
        else {
            return Ok(resp);
        };
        let token = self.exchange_token(&challenge, options).await?;
        let retry = ClientOptions { basic_auth: None, bearer_token: Some(token), ..options.clone() };
        build(&retry).send().await.with_context(|| format!("GET {} (token)", url))
    }

    async fn exchange_token(&self, challenge: &BTreeMap<String, String>, options: &ClientOptions) -> Result<String> {
        let realm = challenge.get("realm").map(String::as_str).unwrap_or_default();
        let mut req = self.clients.client(options)?.get(realm);
        for k in ["service", "scope"] {
            if let Some(v) = challenge.get(k) {
                req = req.query(&[(k, v)]);
            }
        }
        let auth_only = ClientOptions { bearer_token: None, ..options.clone() };
        let resp = with_options(req, &auth_only).send().await.with_context(|| format!("token request to {}", realm))?;
        let resp = resp.error_for_status().with_context(|| format!("token request to {}", realm))?;
        let t: TokenResponse = resp.json().await.context("decoding token response")?;
        t.token.or(t.access_token).filter(|s| !s.is_empty()).ok_or_else(|| anyhow!("token response from {} carries no token", realm))
    }

    async fn expect_ok(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        bail!("{}: {} {}", what, status, body.chars().take(512).collect::<String>())
    }

    /// Tags of `repository` as the registry reports them.
    pub async fn tags(&self, reg: &OciRegistry, repository: &str, options: &ClientOptions) -> Result<Vec<String>> {
        let url = reg.endpoint(&format!("/v2/{}/tags/list", repository));
        let resp = Self::expect_ok(self.get(&url, None, options).await?, &format!("listing tags of {}", repository)).await?;
        let list: TagList = resp.json().await.with_context(|| format!("decoding tags of {}", repository))?;
        Ok(list.tags.unwrap_or_default())
    }

    /// Manifest of `repository:reference` and its digest when the registry reports one.
    pub async fn manifest(
        &self,
        reg: &OciRegistry,
        repository: &str,
        reference: &str,
        options: &ClientOptions,
    ) -> Result<(Manifest, Option<String>)> {
        let url = reg.endpoint(&format!("/v2/{}/manifests/{}", repository, reference));
        let what = format!("pulling manifest {}:{}", repository, reference);
        let resp = Self::expect_ok(self.get(&url, Some(MANIFEST_MEDIA_TYPE), options).await?, &what).await?;
        let digest = resp.headers().get("docker-content-digest").and_then(|v| v.to_str().ok()).map(str::to_string);
        let m: Manifest = resp.json().await.with_context(|| format!("decoding manifest {}:{}", repository, reference))?;
        Ok((m, digest))
    }

    pub async fn blob(&self, reg: &OciRegistry, repository: &str, digest: &str, options: &ClientOptions) -> Result<Vec<u8>> {
        let url = reg.endpoint(&format!("/v2/{}/blobs/{}", repository, digest));
        let resp = Self::expect_ok(self.get(&url, None, options).await?, &format!("pulling blob {}@{}", repository, digest)).await?;
        Ok(resp.bytes().await.with_context(|| format!("reading blob {}", digest))?.to_vec())
    }

    /// Chart metadata of `repository:tag` from its config blob, plus the manifest digest.
    pub async fn chart_config(
        &self,
        reg: &OciRegistry,
        repository: &str,
        tag: &str,
        options: &ClientOptions,
    ) -> Result<(ChartConfig, Option<String>)> {
        let (m, digest) = self.manifest(reg, repository, tag, options).await?;
        if !m.config.media_type.is_empty() && m.config.media_type != HELM_CONFIG_MEDIA_TYPE {
            bail!("{}:{} is not a helm chart (config media type {})", repository, tag, m.config.media_type);
        }
        let raw = self.blob(reg, repository, &m.config.digest, options).await?;
        let cfg: ChartConfig = serde_json::from_slice(&raw).with_context(|| format!("decoding chart config of {}:{}", repository, tag))?;
        Ok((cfg, digest))
    }

    /// Chart archive of `repository:tag`.
    pub async fn pull_chart(&self, reg: &OciRegistry, repository: &str, tag: &str, options: &ClientOptions) -> Result<Vec<u8>> {
        let (m, _) = self.manifest(reg, repository, tag, options).await?;
        let layer = m
            .layers
            .iter()
            .find(|l| l.media_type == HELM_CHART_MEDIA_TYPE)
            .ok_or_else(|| anyhow!("{}:{} has no chart layer", repository, tag))?;
        let bytes = self.blob(reg, repository, &layer.digest, options).await?;
        debug!(repository = %repository, tag = %tag, bytes = bytes.len(), "chart pulled");
        Ok(bytes)
    }
}

/// Fetches `oci://` chart locators through an [`OciClient`].
#[derive(Clone)]
pub struct OciFetcher {
    client: OciClient,
}

impl OciFetcher {
    pub fn new(client: OciClient) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ChartFetcher for OciFetcher {
    async fn fetch(&self, url: &str, options: &ClientOptions) -> Result<Vec<u8>> {
        let r = ChartRef::parse(url)?;
        let reg = OciRegistry { host: r.host, path: String::new(), plain_http: options.plain_http };
        self.client.pull_chart(&reg, &r.repository, &r.tag, options).await
    }
}
