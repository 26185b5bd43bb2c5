use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chartwatch_core::{AuthResolver, CacheError, ClientOptions, Resource, SecretData, SecretSource};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::helmrepo;

/// The same options for every repository.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth(pub ClientOptions);

#[async_trait]
impl AuthResolver for StaticAuth {
    async fn options_for(&self, _repo: &Resource) -> Result<ClientOptions> { Ok(self.0.clone()) }
}

/// Per-repository credentials and TLS material from the Secret named by
/// `spec.secretRef`, layered over `base`. Repositories without a secret
/// reference get `base` unchanged.
pub struct SecretAuth {
    secrets: Arc<dyn SecretSource>,
    base: ClientOptions,
}

impl SecretAuth {
    pub fn new(secrets: Arc<dyn SecretSource>, base: ClientOptions) -> Self { Self { secrets, base } }
}

#[async_trait]
impl AuthResolver for SecretAuth {
    async fn options_for(&self, repo: &Resource) -> Result<ClientOptions> {
        let Some(name) = helmrepo::secret_name(repo).filter(|n| !n.is_empty()) else {
            return Ok(self.base.clone());
        };
        let ns = &repo.reference.namespace;
        let data = self.secrets.secret(ns, name).await?.ok_or_else(|| {
            anyhow!(CacheError::FailedPrecondition(format!(
                "secret {}/{} referenced by HelmRepository {} not found",
                ns, name, repo.reference
            )))
        })?;
        let registry = if helmrepo::is_oci(repo) { helmrepo::repo_url(repo).and_then(registry_host) } else { None };
        let opts = options_from_secret(&data, registry.as_deref(), self.base.clone())
            .with_context(|| format!("secret {}/{}", ns, name))?;
        debug!(repo = %repo.reference, secret = %name, options = ?opts, "credentials resolved");
        Ok(opts)
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

const DOCKER_CONFIG_JSON: &str = ".dockerconfigjson";

/// `host[:port]` of a repository URL.
fn registry_host(url: &str) -> Option<String> {
    let u = url::Url::parse(url).ok()?;
    let host = u.host_str()?;
    Some(match u.port() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    })
}

/// Host part of a `.dockerconfigjson` key, which may carry a scheme or a path.
fn auths_key_host(key: &str) -> &str {
    let rest = key.split_once("://").map_or(key, |(_, r)| r);
    rest.split('/').next().unwrap_or(rest)
}

fn utf8(data: &SecretData, key: &str) -> Result<Option<String>> {
    data.get(key)
        .map(|v| String::from_utf8(v.clone()).with_context(|| format!("{} is not UTF-8", key)))
        .transpose()
}

fn docker_credentials(raw: &[u8], registry: &str) -> Result<Option<(String, String)>> {
    let cfg: DockerConfig = serde_json::from_slice(raw).with_context(|| format!("parsing {}", DOCKER_CONFIG_JSON))?;
    let Some(entry) = cfg.auths.iter().find(|(k, _)| auths_key_host(k) == registry).map(|(_, v)| v) else {
        return Ok(None);
    };
    if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
        return Ok(Some((u.clone(), p.clone())));
    }
    let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD.decode(auth).context("decoding auth")?;
    let decoded = String::from_utf8(decoded).context("auth is not UTF-8")?;
    let (u, p) = decoded.split_once(':').ok_or_else(|| anyhow!("auth is not user:password"))?;
    Ok(Some((u.to_string(), p.to_string())))
}

/// Map the keys Flux understands onto transport options: `username` and
/// `password`, `bearerToken`, `caFile`, `certFile` with `keyFile`, and for
/// OCI registries a `.dockerconfigjson` entry matching `registry`.
pub fn options_from_secret(data: &SecretData, registry: Option<&str>, base: ClientOptions) -> Result<ClientOptions> {
    let mut opts = base;
    let mut recognised = false;

    let mut tls = opts.tls.take().unwrap_or_default();
    if let Some(ca) = data.get("caFile") {
        tls.ca_cert = Some(ca.clone());
        recognised = true;
    }
    match (data.get("certFile"), data.get("keyFile")) {
        (Some(cert), Some(key)) => {
            tls.client_identity = Some((cert.clone(), key.clone()));
            recognised = true;
        }
        (None, None) => {}
        _ => return Err(anyhow!(CacheError::FailedPrecondition("certFile and keyFile must be set together".into()))),
    }
    opts.tls = Some(tls).filter(|t| !t.is_empty());

    if let (Some(u), Some(p)) = (utf8(data, "username")?, utf8(data, "password")?) {
        opts.basic_auth = Some((u, p));
        recognised = true;
    }
    if let Some(t) = utf8(data, "bearerToken")?.filter(|t| !t.is_empty()) {
        opts.bearer_token = Some(t);
        recognised = true;
    }
    if let (Some(raw), Some(reg)) = (data.get(DOCKER_CONFIG_JSON), registry) {
        recognised = true;
        match docker_credentials(raw, reg)? {
            Some(creds) => opts.basic_auth = Some(creds),
            None => warn!(registry = %reg, "no {} entry for registry", DOCKER_CONFIG_JSON),
        }
    }
    if !recognised {
        warn!(keys = ?data.keys().collect::<Vec<_>>(), "unrecognized type of secret");
    }
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    #[derive(Default)]
    struct FakeSecrets {
        secrets: BTreeMap<(String, String), SecretData>,
        lookups: Mutex<Vec<String>>,
    }

    impl FakeSecrets {
        fn with(mut self, ns: &str, name: &str, data: &[(&str, &[u8])]) -> Self {
            let d = data.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect();
            self.secrets.insert((ns.to_string(), name.to_string()), d);
            self
        }
    }

    #[async_trait]
    impl SecretSource for FakeSecrets {
        async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
            self.lookups.lock().unwrap().push(format!("{}/{}", namespace, name));
            Ok(self.secrets.get(&(namespace.to_string(), name.to_string())).cloned())
        }
    }

    fn repo(spec: serde_json::Value) -> Resource {
        Resource::from_raw(json!({ "metadata": { "name": "private", "namespace": "team-a" }, "spec": spec })).unwrap()
    }

    fn data(pairs: &[(&str, &[u8])]) -> SecretData { pairs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect() }

    #[test]
    fn basic_auth_and_tls_keys() {
        let base = ClientOptions { user_agent: Some("chartwatch/test".into()), ..Default::default() };
        let d = data(&[
            ("username", b"admin"),
            ("password", b"s3cr3t"),
            ("caFile", b"CA"),
            ("certFile", b"CERT"),
            ("keyFile", b"KEY"),
        ]);
        let o = options_from_secret(&d, None, base).unwrap();
        assert_eq!(o.basic_auth, Some(("admin".into(), "s3cr3t".into())));
        assert_eq!(o.user_agent.as_deref(), Some("chartwatch/test"));
        let tls = o.tls.unwrap();
        assert_eq!(tls.ca_cert, Some(b"CA".to_vec()));
        assert_eq!(tls.client_identity, Some((b"CERT".to_vec(), b"KEY".to_vec())));
    }

    #[test]
    fn bearer_token_and_unknown_keys() {
        let o = options_from_secret(&data(&[("bearerToken", b"t0k3n")]), None, ClientOptions::default()).unwrap();
        assert_eq!(o.bearer_token.as_deref(), Some("t0k3n"));
        assert!(o.tls.is_none());

        let o = options_from_secret(&data(&[("token", b"x")]), None, ClientOptions::default()).unwrap();
        assert_eq!(o, ClientOptions::default());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let err = options_from_secret(&data(&[("certFile", b"CERT")]), None, ClientOptions::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CacheError>(), Some(CacheError::FailedPrecondition(_))));
    }

    #[test]
    fn docker_config_entry_for_registry() {
        // "cm9ib3Q6cHVsbA==" is robot:pull
        let cfg = br#"{"auths":{"https://ghcr.io/v1/":{"auth":"cm9ib3Q6cHVsbA=="},"registry.local:5000":{"username":"u","password":"p"}}}"#;
        let d = data(&[(".dockerconfigjson", cfg)]);
        let ghcr = options_from_secret(&d, Some("ghcr.io"), ClientOptions::default()).unwrap();
        assert_eq!(ghcr.basic_auth, Some(("robot".into(), "pull".into())));
        let local = options_from_secret(&d, Some("registry.local:5000"), ClientOptions::default()).unwrap();
        assert_eq!(local.basic_auth, Some(("u".into(), "p".into())));
        let other = options_from_secret(&d, Some("quay.io"), ClientOptions::default()).unwrap();
        assert_eq!(other.basic_auth, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolves_from_referenced_secret() {
        let secrets = Arc::new(
            FakeSecrets::default()
                .with("team-a", "creds", &[("username", b"admin"), ("password", b"s3cr3t")])
                .with("team-a", "ghcr", &[(".dockerconfigjson", br#"{"auths":{"ghcr.io":{"auth":"cm9ib3Q6cHVsbA=="}}}"#)]),
        );
        let auth = SecretAuth::new(secrets.clone(), ClientOptions::default());

        let open = auth.options_for(&repo(json!({ "url": "https://charts.example.com" }))).await.unwrap();
        assert_eq!(open, ClientOptions::default());

        let http = repo(json!({ "url": "https://charts.example.com", "secretRef": { "name": "creds" } }));
        let o = auth.options_for(&http).await.unwrap();
        assert_eq!(o.basic_auth, Some(("admin".into(), "s3cr3t".into())));

        let oci = repo(json!({ "url": "oci://ghcr.io/stefanprodan/charts", "type": "oci", "secretRef": { "name": "ghcr" } }));
        let o = auth.options_for(&oci).await.unwrap();
        assert_eq!(o.basic_auth, Some(("robot".into(), "pull".into())));

        let missing = repo(json!({ "url": "https://charts.example.com", "secretRef": { "name": "gone" } }));
        let err = auth.options_for(&missing).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CacheError>(), Some(CacheError::FailedPrecondition(_))), "{:#}", err);

        assert_eq!(*secrets.lookups.lock().unwrap(), vec!["team-a/creds", "team-a/ghcr", "team-a/gone"]);
    }
}
