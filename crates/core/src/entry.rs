//! Cache values and their binary envelope.
//!
//! Every stored value is `[kind, version] ++ bincode(body)`. Decoding checks
//! both header bytes before touching the body, so a value written by a
//! different cache (or an older layout) fails with `CacheError::Decode`
//! instead of being misread.

use std::cmp::Ordering;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{CacheError, CacheResult, ResourceRef};

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: String,
    pub email: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartVersion {
    pub version: String,
    pub app_version: String,
    pub digest: String,
    /// Download locators; the first one is used for fetching.
    pub urls: SmallVec<[String; 1]>,
}

impl ChartVersion {
    pub fn download_url(&self) -> Option<&str> { self.urls.first().map(|s| s.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMetadata {
    /// `repo/name`
    pub id: String,
    pub name: String,
    pub repo: ResourceRef,
    pub description: String,
    pub home: String,
    pub icon: String,
    pub keywords: Vec<String>,
    pub maintainers: Vec<Maintainer>,
    /// Newest first.
    pub versions: Vec<ChartVersion>,
}

impl ChartMetadata {
    pub fn new(repo: ResourceRef, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("{}/{}", repo.name, name),
            name,
            repo,
            description: String::new(),
            home: String::new(),
            icon: String::new(),
            keywords: Vec::new(),
            maintainers: Vec::new(),
            versions: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&ChartVersion> { self.versions.first() }

    /// Sort versions newest first. Semver-parsable versions come first in
    /// descending order; the rest keep their relative order after them.
    pub fn sort_versions(&mut self) {
        self.versions.sort_by(|a, b| {
            let pa = semver::Version::parse(a.version.trim_start_matches('v')).ok();
            let pb = semver::Version::parse(b.version.trim_start_matches('v')).ok();
            match (pa, pb) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Default,
    Oci,
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoKind::Default => f.write_str("default"),
            RepoKind::Oci => f.write_str("oci"),
        }
    }
}

/// Value stored for one repository resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub checksum: String,
    pub charts: Vec<ChartMetadata>,
    pub kind: RepoKind,
}

/// Raw chart archive bytes as stored by the chart cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartBlob(pub Vec<u8>);

/// A typed value with a single encode/decode pair used at the store boundary.
pub trait CacheValue: Sized + Send + Sync + 'static {
    fn encode(&self) -> CacheResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> CacheResult<Self>;
}

fn encode_tagged<T: Serialize>(tag: u8, value: &T) -> CacheResult<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| CacheError::Internal(format!("encode: {}", e)))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(tag);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_tagged<T: DeserializeOwned>(tag: u8, bytes: &[u8]) -> CacheResult<T> {
    match bytes {
        [t, v, body @ ..] if *t == tag && *v == ENVELOPE_VERSION => {
            bincode::deserialize(body).map_err(|e| CacheError::Decode(e.to_string()))
        }
        [t, v, ..] => Err(CacheError::Decode(format!(
            "unexpected envelope kind={} version={} (want kind={} version={})",
            t, v, tag, ENVELOPE_VERSION
        ))),
        _ => Err(CacheError::Decode(format!("value too short ({} bytes)", bytes.len()))),
    }
}

const TAG_REPO: u8 = b'r';
const TAG_CHART: u8 = b'c';

impl CacheValue for CacheEntry {
    fn encode(&self) -> CacheResult<Vec<u8>> { encode_tagged(TAG_REPO, self) }
    fn decode(bytes: &[u8]) -> CacheResult<Self> { decode_tagged(TAG_REPO, bytes) }
}

impl CacheValue for ChartBlob {
    fn encode(&self) -> CacheResult<Vec<u8>> { encode_tagged(TAG_CHART, &self.0) }
    fn decode(bytes: &[u8]) -> CacheResult<Self> { decode_tagged(TAG_CHART, bytes).map(ChartBlob) }
}
