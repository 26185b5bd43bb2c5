//! chartwatch core types: resources, watch events, cache values, keys and the
//! seams (source, fetcher, observer) the caches are built around.

#![forbid(unsafe_code)]

use std::fmt;

use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod entry;
pub mod error;
pub mod keys;
pub mod observer;

pub use entry::{CacheEntry, CacheValue, ChartBlob, ChartMetadata, ChartVersion, Maintainer, RepoKind};
pub use error::{CacheError, CacheResult};
pub use observer::{CacheObserver, ItemOutcome, MetricsObserver, NoopObserver};

/// Identity of a namespaced resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A resource as observed from the control plane. The raw object is kept
/// verbatim; kind-specific field semantics live with the sink that reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub reference: ResourceRef,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub raw: serde_json::Value,
}

impl Resource {
    /// Build from a raw object carrying `metadata.{name,namespace}`.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self> {
        let meta = raw.get("metadata").ok_or_else(|| anyhow!("object missing metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing metadata.name"))?
            .to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object {} missing metadata.namespace", name))?
            .to_string();
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let generation = meta.get("generation").and_then(|v| v.as_i64());
        Ok(Self { reference: ResourceRef { namespace, name }, resource_version, generation, raw })
    }

    pub fn field(&self, path: &[&str]) -> Option<&serde_json::Value> {
        path.iter().try_fold(&self.raw, |v, seg| v.get(*seg))
    }

    pub fn str_field(&self, path: &[&str]) -> Option<&str> {
        self.field(path).and_then(|v| v.as_str())
    }

    pub fn i64_field(&self, path: &[&str]) -> Option<i64> {
        self.field(path).and_then(|v| v.as_i64())
    }
}

/// Opaque token handed out by `list` and consumed by `watch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResyncToken(pub String);

impl fmt::Display for ResyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Added,
    Modified,
    Deleted,
}

/// One item of a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Progress marker; the token may be used to resume the watch.
    Bookmark(ResyncToken),
    /// The token is too old or the stream is gone; a full resync is required.
    Invalidated,
}

impl WatchEvent {
    pub fn delta(self) -> Option<(DeltaKind, Resource)> {
        match self {
            WatchEvent::Added(r) => Some((DeltaKind::Added, r)),
            WatchEvent::Modified(r) => Some((DeltaKind::Modified, r)),
            WatchEvent::Deleted(r) => Some((DeltaKind::Deleted, r)),
            WatchEvent::Bookmark(_) | WatchEvent::Invalidated => None,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Remote, versioned, eventually-notifying resource store.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync {
    /// All resources matching the source's selector plus a token to resume from.
    async fn list(&self) -> Result<(Vec<Resource>, ResyncToken)>;

    /// Stream of changes after `token`. Connection failures surface as `Err`
    /// items; an expired token surfaces as `WatchEvent::Invalidated`.
    async fn watch(&self, token: &ResyncToken) -> Result<WatchStream>;

    /// Current state of a single resource, `None` when it no longer exists.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<Resource>>;
}

/// PEM material for talking to a repository over TLS.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsConfig {
    /// Extra trust anchor (`caFile`).
    pub ca_cert: Option<Vec<u8>>,
    /// Client certificate and private key (`certFile`, `keyFile`).
    pub client_identity: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsConfig {
    pub fn is_empty(&self) -> bool { self.ca_cert.is_none() && self.client_identity.is_none() }
}

/// Transport options for fetching index documents and chart archives.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub basic_auth: Option<(String, String)>,
    pub bearer_token: Option<String>,
    pub user_agent: Option<String>,
    pub plain_http: bool,
    pub tls: Option<TlsConfig>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("basic_auth", &self.basic_auth.as_ref().map(|(u, _)| (u.as_str(), "***")))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("user_agent", &self.user_agent)
            .field("plain_http", &self.plain_http)
            .field("ca_cert", &self.tls.as_ref().map_or(false, |t| t.ca_cert.is_some()))
            .field("client_identity", &self.tls.as_ref().map_or(false, |t| t.client_identity.is_some()))
            .finish()
    }
}

/// Downloads bytes (index documents, chart archives) from a locator.
#[async_trait::async_trait]
pub trait ChartFetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &ClientOptions) -> Result<Vec<u8>>;
}

/// Resolves transport options (credentials, TLS, user agent) for a repository.
#[async_trait::async_trait]
pub trait AuthResolver: Send + Sync {
    async fn options_for(&self, repo: &Resource) -> Result<ClientOptions>;
}

/// Key/value payload of a Secret, values already base64-decoded.
pub type SecretData = std::collections::BTreeMap<String, Vec<u8>>;

/// Read access to the Secrets repositories reference for credentials.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    /// `None` when the Secret does not exist.
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;
}

pub mod prelude {
    pub use super::{
        AuthResolver, CacheEntry, CacheError, CacheResult, CacheValue, ChartBlob, ChartFetcher, ChartMetadata, ChartVersion,
        ClientOptions, DeltaKind, RepoKind, Resource, ResourceRef, ResourceSource, ResyncToken, SecretData, SecretSource, TlsConfig, WatchEvent,
        WatchStream,
    };
}
