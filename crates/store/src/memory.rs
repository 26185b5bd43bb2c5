use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;

use crate::{glob_to_regex, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Get(String),
    Set(String),
    Delete(String),
    Exists(String),
    Scan(String),
    Flush,
}

/// In-process store. Used by tests and by `chartwatchctl serve --store memory`.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<FxHashMap<String, Vec<u8>>>,
    journal: Option<Mutex<Vec<StoreOp>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// A store that records every operation, see [`MemoryStore::ops`].
    pub fn with_journal() -> Self { Self { journal: Some(Mutex::new(Vec::new())), ..Self::default() } }

    fn map(&self) -> MutexGuard<'_, FxHashMap<String, Vec<u8>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: StoreOp) -> Result<()> {
        if let Some(j) = &self.journal {
            j.lock().unwrap_or_else(PoisonError::into_inner).push(op);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("memory store marked unavailable"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.map().len() }

    pub fn is_empty(&self) -> bool { self.map().is_empty() }

    /// Sorted copy of the contents.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.map().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drop a key behind the caches' back, as an evicting server would.
    pub fn evict(&self, key: &str) -> bool { self.map().remove(key).is_some() }

    /// Make every subsequent operation fail until cleared.
    pub fn set_unavailable(&self, v: bool) { self.unavailable.store(v, Ordering::SeqCst) }

    pub fn ops(&self) -> Vec<StoreOp> {
        match &self.journal {
            Some(j) => j.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            None => Vec::new(),
        }
    }

    pub fn clear_ops(&self) {
        if let Some(j) = &self.journal {
            j.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.record(StoreOp::Get(key.to_string()))?;
        Ok(self.map().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.record(StoreOp::Set(key.to_string()))?;
        self.map().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.record(StoreOp::Delete(key.to_string()))?;
        Ok(self.map().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.record(StoreOp::Exists(key.to_string()))?;
        Ok(self.map().contains_key(key))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.record(StoreOp::Scan(pattern.to_string()))?;
        let re = glob_to_regex(pattern)?;
        let mut keys: Vec<String> = self.map().keys().filter(|k| re.is_match(k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        self.record(StoreOp::Flush)?;
        self.map().clear();
        Ok(())
    }
}
