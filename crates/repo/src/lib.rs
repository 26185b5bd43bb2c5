//! chartwatch repo: the HelmRepository event sink.
//!
//! Plain repositories are indexed from the controller-served `index.yaml`;
//! OCI repositories are enumerated through a registry lister picked per
//! registry. Either way the newest version of every chart is queued on the
//! chart cache.

#![forbid(unsafe_code)]

pub mod auth;
pub mod helmrepo;
pub mod http;
pub mod index;
pub mod oci;
mod sink;

pub use auth::{options_from_secret, SecretAuth, StaticAuth};
pub use chartwatch_core::AuthResolver;
pub use helmrepo::Readiness;
pub use http::HttpFetcher;
pub use index::{HelmIndexer, Indexer};
pub use oci::{DockerV2Lister, HarborLister, ListerSelector, OciClient, OciFetcher, OciRegistry, OciRepositoryLister};
pub use sink::RepoEventSink;

/// Key prefix (the resource plural) used for repository entries.
pub const REPO_KEY_PREFIX: &str = "helmrepositories";
