//! chartwatch kubehub: list/watch/get of one resource kind over the Kubernetes API.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chartwatch_core::{Resource, ResourceRef, ResourceSource, ResyncToken, SecretData, SecretSource, WatchEvent, WatchStream};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info, warn};

/// Server-side watch timeout, seconds. Must stay below the 295s kube cap.
const WATCH_TIMEOUT_SECS: u32 = 290;
const HTTP_GONE: u16 = 410;

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

pub fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Established" && c.status == "True"))
        .unwrap_or(false)
}

async fn ensure_crd_established(client: Client, ar: &ApiResource) -> Result<()> {
    if ar.group.is_empty() {
        return Ok(());
    }
    let name = format!("{}.{}", ar.plural, ar.group);
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd = crds.get_opt(&name).await.with_context(|| format!("reading CRD {}", name))?;
    match crd {
        Some(crd) if crd_established(&crd) => Ok(()),
        Some(_) => Err(anyhow!("CRD [{}] is not established", name)),
        None => Err(anyhow!("CRD [{}] not found", name)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_resource(obj: &DynamicObject) -> Result<Resource> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Resource::from_raw(raw)
}

/// Translate one kube watch event. Expired resource versions become `Invalidated`.
pub fn map_watch_event(ev: kube::core::WatchEvent<DynamicObject>) -> Result<WatchEvent> {
    use kube::core::WatchEvent as K;
    let (label, out) = match ev {
        K::Added(o) => ("added", WatchEvent::Added(to_resource(&o)?)),
        K::Modified(o) => ("modified", WatchEvent::Modified(to_resource(&o)?)),
        K::Deleted(o) => ("deleted", WatchEvent::Deleted(to_resource(&o)?)),
        K::Bookmark(b) => ("bookmark", WatchEvent::Bookmark(ResyncToken(b.metadata.resource_version))),
        K::Error(e) if e.code == HTTP_GONE => ("gone", WatchEvent::Invalidated),
        K::Error(e) => return Err(anyhow!("watch error {}: {}", e.code, e.message)),
    };
    metrics::counter!("kube_watch_events_total", 1u64, "type" => label);
    Ok(out)
}

fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == HTTP_GONE)
}

/// `ResourceSource` for one GVK, across all namespaces or just one.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeSource {
    pub async fn connect(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        if !namespaced {
            return Err(anyhow!("{} is cluster-scoped; only namespaced resources can be cached", gvk_key));
        }
        ensure_crd_established(client.clone(), &ar).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, plural = %ar.plural, "kube source ready");
        Ok(Self { api, ar, namespaced })
    }

    /// Plural resource name, used as the store key prefix.
    pub fn plural(&self) -> &str { &self.ar.plural }

    pub fn namespaced(&self) -> bool { self.namespaced }
}

#[async_trait::async_trait]
impl ResourceSource for KubeSource {
    async fn list(&self) -> Result<(Vec<Resource>, ResyncToken)> {
        let t0 = std::time::Instant::now();
        let list = self.api.list(&ListParams::default()).await.context("listing resources")?;
        let token = ResyncToken(list.metadata.resource_version.clone().unwrap_or_default());
        let mut out = Vec::with_capacity(list.items.len());
        for o in list.items.iter() {
            match to_resource(o) {
                Ok(r) => out.push(r),
                Err(e) => warn!(error = %e, "skipping unreadable object in list"),
            }
        }
        info!(count = out.len(), token = %token, took_ms = %t0.elapsed().as_millis(), "list complete");
        Ok((out, token))
    }

    async fn watch(&self, token: &ResyncToken) -> Result<WatchStream> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let events = match self.api.watch(&wp, &token.0).await {
            Ok(s) => s,
            Err(e) if is_gone(&e) => {
                debug!(token = %token, "watch token expired");
                return Ok(stream::once(async { Ok(WatchEvent::Invalidated) }).boxed());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("opening watch")),
        };
        Ok(events
            .map(|item| match item {
                Ok(ev) => map_watch_event(ev),
                Err(e) if is_gone(&e) => Ok(WatchEvent::Invalidated),
                Err(e) => Err(anyhow::Error::new(e).context("watch stream")),
            })
            .boxed())
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Option<Resource>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.api.clone().into_client(), &reference.namespace, &self.ar);
        match api.get_opt(&reference.name).await.with_context(|| format!("getting {}", reference))? {
            Some(o) => Ok(Some(to_resource(&o)?)),
            None => Ok(None),
        }
    }
}

/// Decoded `data` of a Secret. `stringData` is write-only and never returned by the API.
pub fn secret_data(secret: &Secret) -> SecretData {
    secret.data.iter().flatten().map(|(k, v)| (k.clone(), v.0.clone())).collect()
}

/// Secrets read straight from the API server.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl SecretSource for KubeSecrets {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await.with_context(|| format!("getting secret {}/{}", namespace, name))?;
        debug!(ns = %namespace, name = %name, found = secret.is_some(), "secret lookup");
        Ok(secret.as_ref().map(secret_data))
    }
}
