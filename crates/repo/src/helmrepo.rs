//! Field accessors for HelmRepository objects.

use chartwatch_core::Resource;
use serde_json::Value;

/// Where a repository stands with respect to its last reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not reconciled yet (or reconciling a newer generation).
    NotReady,
    /// Reconciled with `Ready=False`; carries the condition message.
    Failed(String),
}

/// `Ready` requires the controller to have observed the current generation
/// and to report condition `Ready=True`.
pub fn readiness(repo: &Resource) -> Readiness {
    let Some(observed) = repo.i64_field(&["status", "observedGeneration"]) else {
        return Readiness::NotReady;
    };
    match repo.generation {
        Some(g) if g == observed => {}
        _ => return Readiness::NotReady,
    }
    let Some(conditions) = repo.field(&["status", "conditions"]).and_then(Value::as_array) else {
        return Readiness::NotReady;
    };
    for c in conditions {
        if c.get("type").and_then(Value::as_str) != Some("Ready") {
            continue;
        }
        match c.get("status").and_then(Value::as_str) {
            Some("True") => return Readiness::Ready,
            Some("False") => {
                let msg = c
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("no message available in condition: {}", c));
                return Readiness::Failed(msg);
            }
            _ => {}
        }
    }
    Readiness::NotReady
}

/// Content digest published by the controller once the index is fetched.
pub fn checksum(repo: &Resource) -> Option<&str> {
    repo.str_field(&["status", "artifact", "checksum"])
        .or_else(|| repo.str_field(&["status", "artifact", "digest"]))
        .filter(|s| !s.is_empty())
}

/// URL of the controller-served copy of the index.
pub fn index_url(repo: &Resource) -> Option<&str> {
    repo.str_field(&["status", "artifact", "url"])
        .or_else(|| repo.str_field(&["status", "url"]))
        .filter(|s| !s.is_empty())
}

/// `spec.url`, the upstream repository location.
pub fn repo_url(repo: &Resource) -> Option<&str> { repo.str_field(&["spec", "url"]).map(str::trim).filter(|s| !s.is_empty()) }

pub fn is_oci(repo: &Resource) -> bool { repo.str_field(&["spec", "type"]) == Some("oci") }

/// OCI registries are reached over plain HTTP when the repository is marked insecure.
pub fn is_insecure(repo: &Resource) -> bool { repo.field(&["spec", "insecure"]).and_then(Value::as_bool).unwrap_or(false) }

pub fn secret_name(repo: &Resource) -> Option<&str> { repo.str_field(&["spec", "secretRef", "name"]) }
