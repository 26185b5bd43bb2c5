use std::fmt;

use anyhow::{anyhow, Context, Result};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;
use tracing::info;

use crate::Store;

const SCAN_COUNT: usize = 100;

/// Connection settings, read from `REDIS_ADDR`, `REDIS_PASSWORD`, `REDIS_DB`.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("addr", &self.addr)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .finish()
    }
}

impl RedisConfig {
    pub fn from_env() -> Result<Self> { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let addr = lookup("REDIS_ADDR").ok_or_else(|| anyhow!("missing environment variable REDIS_ADDR"))?;
        let password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());
        let db = match lookup("REDIS_DB") {
            Some(s) => s.parse::<i64>().with_context(|| format!("parsing REDIS_DB [{}]", s))?,
            None => 0,
        };
        Ok(Self { addr, password, db })
    }

    fn connection_info(&self) -> Result<redis::ConnectionInfo> {
        let (host, port) = match self.addr.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse::<u16>().with_context(|| format!("parsing port in [{}]", self.addr))?),
            None => (self.addr.clone(), 6379),
        };
        Ok(redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo { db: self.db, username: None, password: self.password.clone() },
        })
    }
}

/// Redis-backed store. Generic over the connection so tests can drive it
/// with a scripted mock connection.
#[derive(Clone)]
pub struct RedisStore<C: ConnectionLike + Send + Sync + Clone = ConnectionManager> {
    conn: C,
}

impl RedisStore<ConnectionManager> {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.connection_info()?).context("creating redis client")?;
        let mut conn = client.get_tokio_connection_manager().await.context("connecting to redis")?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.context("redis PING")?;
        info!(addr = %cfg.addr, db = cfg.db, pong = %pong, "redis connected");
        Ok(Self { conn })
    }
}

impl<C: ConnectionLike + Send + Sync + Clone> RedisStore<C> {
    pub fn with_connection(conn: C) -> Self { Self { conn } }
}

#[async_trait::async_trait]
impl<C: ConnectionLike + Send + Sync + Clone> Store for RedisStore<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.del(key).await?;
        Ok(n > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SCAN {} MATCH {}", cursor, pattern))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<_, ()>(&mut conn).await.context("FLUSHDB")?;
        Ok(())
    }
}
