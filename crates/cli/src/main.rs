use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chartwatch_charts::{ChartCache, ChartCacheConfig};
use chartwatch_core::keys::{chart_key, resource_key};
use chartwatch_core::{CacheEntry, ChartFetcher, ClientOptions, MetricsObserver, ResourceRef, ResourceSource};
use chartwatch_kubehub::{KubeSecrets, KubeSource};
use chartwatch_repo::{HttpFetcher, OciClient, RepoEventSink, SecretAuth, REPO_KEY_PREFIX};
use chartwatch_store::{get_value, MemoryStore, RedisConfig, RedisStore, Store};
use chartwatch_watch::{WatcherCache, WatcherCacheConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chartwatchctl", version, about = "chartwatch: cached view of Helm repositories and charts")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreKind { Redis, Memory }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch HelmRepository objects and keep the cache in sync until Ctrl-C
    Serve {
        /// GVK key of the repository resource
        #[arg(long, env = "CHARTWATCH_GVK", default_value = "source.toolkit.fluxcd.io/v1beta2/HelmRepository")]
        gvk: String,
        /// Restrict to one namespace (default: all)
        #[arg(long = "ns", env = "CHARTWATCH_NAMESPACE")]
        namespace: Option<String>,
        /// Cache backend; redis reads REDIS_ADDR, REDIS_PASSWORD and REDIS_DB
        #[arg(long, value_enum, env = "CHARTWATCH_STORE", default_value_t = StoreKind::Redis)]
        store: StoreKind,
        /// HTTP timeout for index, archive and registry requests
        #[arg(long, env = "CHARTWATCH_HTTP_TIMEOUT_SECS", default_value_t = 60)]
        http_timeout_secs: u64,
        /// User agent sent to repositories and registries
        #[arg(long, env = "CHARTWATCH_USER_AGENT")]
        user_agent: Option<String>,
    },
    /// Print the chart cache key for a chart version
    Key {
        namespace: String,
        /// `repo/chart`
        chart_id: String,
        version: String,
    },
    /// Print the cached entry of a repository
    Get {
        namespace: String,
        name: String,
        /// Key prefix the repository cache was started with
        #[arg(long, default_value = REPO_KEY_PREFIX)]
        prefix: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CHARTWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CHARTWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CHARTWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

async fn open_store(kind: StoreKind) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match kind {
        StoreKind::Redis => {
            let cfg = RedisConfig::from_env()?;
            Arc::new(RedisStore::connect(&cfg).await?)
        }
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

async fn serve(
    gvk: &str,
    namespace: Option<&str>,
    store: StoreKind,
    timeout: Duration,
    user_agent: Option<String>,
) -> Result<()> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let source = KubeSource::connect(client.clone(), gvk, namespace).await?;
    let prefix = source.plural().to_string();
    let store = open_store(store).await?;

    let charts = Arc::new(ChartCache::new(ChartCacheConfig::new("charts"), Arc::clone(&store), Arc::new(MetricsObserver)));

    let http: Arc<dyn ChartFetcher> = Arc::new(HttpFetcher::new(timeout)?);
    let auth = SecretAuth::new(Arc::new(KubeSecrets::new(client)), ClientOptions { user_agent, ..Default::default() });
    let sink = RepoEventSink::new(prefix.clone(), Arc::clone(&charts), http, OciClient::new(timeout)?).with_auth(Arc::new(auth));

    let source: Arc<dyn ResourceSource> = Arc::new(source);
    let repos =
        WatcherCache::start(WatcherCacheConfig::new("repos", prefix), source, store, Arc::new(sink), Arc::new(MetricsObserver))
            .await?;
    info!(gvk = %gvk, ns = ?namespace, "serving; press Ctrl-C to stop");

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    repos.shutdown().await;
    charts.shutdown().await;
    Ok(())
}

async fn get(namespace: &str, name: &str, prefix: &str, output: Output) -> Result<()> {
    let key = resource_key(prefix, &ResourceRef::new(namespace, name))?;
    let store = RedisStore::connect(&RedisConfig::from_env()?).await?;
    let entry = match get_value::<CacheEntry>(&store, &key).await? {
        Some(v) => v?,
        None => {
            eprintln!("{}: not cached", key);
            return Ok(());
        }
    };
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
        Output::Human => {
            println!("{} • {} • checksum {}", key, entry.kind, entry.checksum);
            for c in &entry.charts {
                let latest = c.latest().map(|v| v.version.as_str()).unwrap_or("-");
                println!("  {} • {} • {} versions", c.id, latest, c.versions.len());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { gvk, namespace, store, http_timeout_secs, user_agent } => {
            serve(&gvk, namespace.as_deref(), store, Duration::from_secs(http_timeout_secs), user_agent).await?;
        }
        Commands::Key { namespace, chart_id, version } => {
            let key = chart_key(&namespace, &chart_id, &version)?;
            match cli.output {
                Output::Human => println!("{}", key),
                Output::Json => println!("{}", serde_json::json!({ "key": key })),
            }
        }
        Commands::Get { namespace, name, prefix } => get(&namespace, &name, &prefix, cli.output).await?,
    }
    Ok(())
}
