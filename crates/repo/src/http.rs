use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chartwatch_core::{ChartFetcher, ClientOptions, TlsConfig};
use reqwest::{Certificate, Identity, RequestBuilder};
use rustc_hash::FxHashMap;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = concat!("chartwatch/", env!("CARGO_PKG_VERSION"));

/// Attach credentials and user agent from `options` to a request.
pub(crate) fn with_options(mut req: RequestBuilder, options: &ClientOptions) -> RequestBuilder {
    if let Some((user, pass)) = &options.basic_auth {
        req = req.basic_auth(user, Some(pass));
    } else if let Some(token) = &options.bearer_token {
        req = req.bearer_auth(token);
    }
    if let Some(ua) = &options.user_agent {
        req = req.header(reqwest::header::USER_AGENT, ua);
    }
    req
}

fn build_client(timeout: Duration, tls: Option<&TlsConfig>) -> Result<reqwest::Client> {
    let mut b = reqwest::Client::builder().user_agent(DEFAULT_USER_AGENT).timeout(timeout);
    if let Some(tls) = tls {
        if let Some(ca) = &tls.ca_cert {
            b = b.add_root_certificate(Certificate::from_pem(ca).context("parsing caFile")?);
        }
        if let Some((cert, key)) = &tls.client_identity {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            b = b.identity(Identity::from_pem(&pem).context("parsing certFile/keyFile")?);
        }
    }
    b.build().context("building HTTP client")
}

/// reqwest clients keyed by TLS material. Repositories without TLS settings
/// share one client.
#[derive(Clone)]
pub(crate) struct ClientPool {
    timeout: Duration,
    default: reqwest::Client,
    with_tls: Arc<Mutex<FxHashMap<TlsConfig, reqwest::Client>>>,
}

impl ClientPool {
    pub(crate) fn new(timeout: Duration) -> Result<Self> {
        Ok(Self { timeout, default: build_client(timeout, None)?, with_tls: Arc::default() })
    }

    pub(crate) fn client(&self, options: &ClientOptions) -> Result<reqwest::Client> {
        let Some(tls) = options.tls.as_ref().filter(|t| !t.is_empty()) else {
            return Ok(self.default.clone());
        };
        let mut clients = self.with_tls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = clients.get(tls) {
            return Ok(c.clone());
        }
        let c = build_client(self.timeout, Some(tls))?;
        clients.insert(tls.clone(), c.clone());
        debug!(clients = clients.len(), "built TLS client");
        Ok(c)
    }
}

/// Plain HTTP(S) GET fetcher for index documents and chart archives.
#[derive(Clone)]
pub struct HttpFetcher {
    clients: ClientPool,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> { Ok(Self { clients: ClientPool::new(timeout)? }) }
}

#[async_trait::async_trait]
impl ChartFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, options: &ClientOptions) -> Result<Vec<u8>> {
        let t0 = Instant::now();
        let client = self.clients.client(options)?;
        let resp = with_options(client.get(url), options).send().await.with_context(|| format!("GET {}", url))?;
        let status = resp.status();
        metrics::counter!("http_fetch_total", 1u64, "status" => status.as_u16().to_string());
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let body = resp.bytes().await.with_context(|| format!("reading body of {}", url))?;
        debug!(url = %url, status = %status, bytes = body.len(), took_ms = %t0.elapsed().as_millis(), "fetched");
        Ok(body.to_vec())
    }
}
