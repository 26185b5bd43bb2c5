//! Errors surfaced across the cache boundary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CacheError {
    #[error("internal: {0}")]
    Internal(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Transient: store or remote endpoint could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("failed_precondition: {0}")]
    FailedPrecondition(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Errors that retrying the same work item cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CacheError::Unsupported(_) | CacheError::Decode(_) | CacheError::FailedPrecondition(_))
    }

    /// Inspect an `anyhow` chain for a permanent `CacheError`.
    pub fn is_permanent_any(err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|e| e.downcast_ref::<CacheError>())
            .any(|e| e.is_permanent())
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<CacheError>() {
            Ok(inner) => inner,
            Err(e) => CacheError::Internal(format!("{:#}", e)),
        }
    }
}
