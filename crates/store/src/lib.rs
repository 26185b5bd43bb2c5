//! chartwatch store: the external key/value cache both caches write into.
//!
//! The store is treated as unreliable memory. Entries may vanish at any time
//! (eviction, flush by another instance); callers read a miss in that case and
//! recompute from the authoritative source.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::Result;
use chartwatch_core::{CacheResult, CacheValue};

mod memory;
mod redis_store;

pub use memory::{MemoryStore, StoreOp};
pub use redis_store::{RedisConfig, RedisStore};

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Keys matching a redis-style glob (`*`, `?`, `[...]`, `\` escapes).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
    /// Drop every key in the store's namespace.
    async fn flush(&self) -> Result<()>;
}

/// Read and decode one value. Store failures are returned as `Err`; a stored
/// value that fails to decode is a `CacheError::Decode` in the inner result.
pub async fn get_value<V: CacheValue>(store: &dyn Store, key: &str) -> Result<Option<CacheResult<V>>> {
    let t0 = Instant::now();
    let bytes = store.get(key).await?;
    metrics::histogram!("store_get_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(bytes.map(|b| V::decode(&b)))
}

pub async fn set_value<V: CacheValue>(store: &dyn Store, key: &str, value: &V) -> Result<()> {
    let bytes = value.encode()?;
    let len = bytes.len();
    let t0 = Instant::now();
    store.set(key, bytes).await?;
    metrics::histogram!("store_set_ms", t0.elapsed().as_secs_f64() * 1000.0);
    metrics::counter!("store_set_bytes_total", len as u64);
    Ok(())
}

/// Translate a redis glob into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => match chars.next() {
                Some(n) => re.push_str(&regex::escape(&n.to_string())),
                None => re.push_str(r"\\"),
            },
            '[' => {
                re.push('[');
                for n in chars.by_ref() {
                    match n {
                        ']' => break,
                        '\\' | '[' | '&' | '~' => {
                            re.push('\\');
                            re.push(n);
                        }
                        _ => re.push(n),
                    }
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Ok(regex::Regex::new(&re)?)
}
