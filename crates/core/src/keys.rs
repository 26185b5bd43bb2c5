//! Store key derivation. Keys follow the redis `object-type:id` convention:
//! repositories are `<resource>:<namespace>:<name>`, chart archives are
//! `helmcharts:<namespace>:<repo>/<chart>:<version>`.

use crate::{CacheError, CacheResult, ResourceRef};

pub const KEY_SEPARATOR: char = ':';
pub const CHART_KEY_PREFIX: &str = "helmcharts";

fn check_segment(what: &str, seg: &str) -> CacheResult<()> {
    if seg.is_empty() {
        return Err(CacheError::Internal(format!("empty {} in key", what)));
    }
    if seg.contains(KEY_SEPARATOR) {
        return Err(CacheError::Internal(format!("{} [{}] contains '{}'", what, seg, KEY_SEPARATOR)));
    }
    Ok(())
}

pub fn resource_key(kind: &str, reference: &ResourceRef) -> CacheResult<String> {
    check_segment("kind", kind)?;
    check_segment("namespace", &reference.namespace)?;
    check_segment("name", &reference.name)?;
    Ok(format!("{}{sep}{}{sep}{}", kind, reference.namespace, reference.name, sep = KEY_SEPARATOR))
}

pub fn parse_resource_key(kind: &str, key: &str) -> CacheResult<ResourceRef> {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    match parts.as_slice() {
        [k, ns, name] if *k == kind && !ns.is_empty() && !name.is_empty() => Ok(ResourceRef::new(*ns, *name)),
        _ => Err(CacheError::Internal(format!("invalid key [{}]", key))),
    }
}

/// Parsed chart archive key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChartKey {
    pub namespace: String,
    pub chart_id: String,
    pub version: String,
}

impl ChartKey {
    /// Repository name, i.e. the part of the chart id before the first '/'.
    pub fn repo_name(&self) -> Option<&str> {
        self.chart_id.split_once('/').map(|(repo, _)| repo)
    }
}

pub fn chart_key(namespace: &str, chart_id: &str, version: &str) -> CacheResult<String> {
    check_segment("namespace", namespace)?;
    check_segment("chart id", chart_id)?;
    check_segment("version", version)?;
    Ok(format!(
        "{}{sep}{}{sep}{}{sep}{}",
        CHART_KEY_PREFIX,
        namespace,
        chart_id,
        version,
        sep = KEY_SEPARATOR
    ))
}

pub fn parse_chart_key(key: &str) -> CacheResult<ChartKey> {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    match parts.as_slice() {
        [prefix, ns, id, version]
            if *prefix == CHART_KEY_PREFIX && !ns.is_empty() && !id.is_empty() && !version.is_empty() =>
        {
            Ok(ChartKey { namespace: (*ns).to_string(), chart_id: (*id).to_string(), version: (*version).to_string() })
        }
        _ => Err(CacheError::Internal(format!("invalid key [{}]", key))),
    }
}

/// Glob pattern matching every chart key owned by a repository.
pub fn chart_key_pattern_for_repo(repo: &ResourceRef) -> String {
    format!("{}{sep}{}{sep}{}/*{sep}*", CHART_KEY_PREFIX, repo.namespace, repo.name, sep = KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_key_round_trip() {
        let triples = [
            ("default", "bitnami/redis", "14.4.0"),
            ("kube-system", "podinfo/podinfo", "6.0.0+build.1"),
            ("ns", "r/c", "1"),
        ];
        for (ns, id, v) in triples {
            let k = chart_key(ns, id, v).unwrap();
            let parsed = parse_chart_key(&k).unwrap();
            assert_eq!((parsed.namespace.as_str(), parsed.chart_id.as_str(), parsed.version.as_str()), (ns, id, v));
        }
        assert_eq!(chart_key("default", "bitnami/redis", "14.4.0").unwrap(), "helmcharts:default:bitnami/redis:14.4.0");
    }

    #[test]
    fn chart_key_rejects_bad_segments() {
        assert!(matches!(chart_key("", "a/b", "1"), Err(CacheError::Internal(_))));
        assert!(chart_key("ns", "", "1").is_err());
        assert!(chart_key("ns", "a/b", "").is_err());
        assert!(chart_key("ns", "a:b", "1").is_err());
    }

    #[test]
    fn malformed_chart_keys_fail() {
        for k in [
            "",
            "helmcharts",
            "helmcharts:ns:id",
            "helmcharts:ns:id:1:extra",
            "helmcharts::id:1",
            "helmcharts:ns::1",
            "helmcharts:ns:id:",
            "otherkind:ns:id:1",
        ] {
            assert!(matches!(parse_chart_key(k), Err(CacheError::Internal(_))), "{k}");
        }
    }

    #[test]
    fn resource_key_round_trip() {
        let r = ResourceRef::new("default", "bitnami");
        let k = resource_key("helmrepositories", &r).unwrap();
        assert_eq!(k, "helmrepositories:default:bitnami");
        assert_eq!(parse_resource_key("helmrepositories", &k).unwrap(), r);
        assert!(parse_resource_key("gitrepositories", &k).is_err());
        assert!(parse_resource_key("helmrepositories", "helmrepositories:default").is_err());
    }

    #[test]
    fn repo_pattern_and_repo_name() {
        let p = chart_key_pattern_for_repo(&ResourceRef::new("default", "bitnami"));
        assert_eq!(p, "helmcharts:default:bitnami/*:*");
        let k = parse_chart_key("helmcharts:default:bitnami/redis:1.0.0").unwrap();
        assert_eq!(k.repo_name(), Some("bitnami"));
    }
}
