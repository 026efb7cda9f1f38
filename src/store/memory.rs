use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, bail};
use log::trace;

use super::{CacheBackend, CacheKey};
use crate::net::Response;

type Caches = BTreeMap<String, HashMap<CacheKey, Response>>;

/// In-process backend. One mutex guards all caches; every operation is a
/// single short critical section, which makes each per-key get/put atomic.
#[derive(Default)]
pub struct MemoryBackend {
    caches: Mutex<Caches>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Caches>> {
        self.caches
            .lock()
            .map_err(|_| anyhow::anyhow!("[BUG] memory cache mutex poisoned"))
    }
}

impl CacheBackend for MemoryBackend {
    fn cache_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn create(&self, cache: &str) -> Result<()> {
        self.lock()?.entry(cache.to_string()).or_default();
        Ok(())
    }

    fn delete(&self, cache: &str) -> Result<bool> {
        Ok(self.lock()?.remove(cache).is_some())
    }

    fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<Response>> {
        let caches = self.lock()?;
        let hit = caches.get(cache).and_then(|entries| entries.get(key)).cloned();
        trace!("memory: get {cache} {} -> {}", key.url, if hit.is_some() { "hit" } else { "miss" });
        Ok(hit)
    }

    fn put(&self, cache: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let mut caches = self.lock()?;
        let Some(entries) = caches.get_mut(cache) else {
            bail!("cache '{cache}' does not exist");
        };
        trace!("memory: put {cache} {} ({} bytes)", key.url, response.body.len());
        entries.insert(key.clone(), response.clone());
        Ok(())
    }

    fn entry_count(&self, cache: &str) -> Result<usize> {
        Ok(self.lock()?.get(cache).map_or(0, HashMap::len))
    }
}
