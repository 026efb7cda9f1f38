//! Named, versioned response caches.
//!
//! A [`CacheStorage`] holds any number of named caches; the gateway keeps
//! exactly one of them (the current version) after activation. Entries are
//! keyed by exact request (method + URL) and have no expiry: an entry is
//! either present or absent.
//!
//! Backends guarantee per-key atomic `get`/`put`. Nothing else is
//! synchronized; concurrent writers of the same key simply race to store
//! identical bytes.

mod disk;
mod memory;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::net::{Method, Request, Response};

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

/// Exact-request cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl From<&Request> for CacheKey {
    fn from(req: &Request) -> Self {
        Self {
            method: req.method,
            url: req.url.clone(),
        }
    }
}

/// Storage of named caches.
pub trait CacheBackend: Send + Sync {
    /// All cache names, sorted.
    fn cache_names(&self) -> Result<Vec<String>>;

    /// Create the named cache if it does not exist.
    fn create(&self, cache: &str) -> Result<()>;

    /// Delete a cache and all its entries. Returns false if it did not exist.
    fn delete(&self, cache: &str) -> Result<bool>;

    fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<Response>>;

    /// Store an entry. Fails if the cache does not exist (e.g. it was purged
    /// by an activation while a writer still held a handle).
    fn put(&self, cache: &str, key: &CacheKey, response: &Response) -> Result<()>;

    /// Number of entries in a cache (0 if absent).
    fn entry_count(&self, cache: &str) -> Result<usize>;
}

/// Shared handle to all named caches.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Volatile storage, lost when the process exits.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open (creating if needed) the named cache.
    pub fn open(&self, name: &str) -> Result<Cache> {
        self.backend.create(name)?;
        Ok(Cache {
            backend: Arc::clone(&self.backend),
            name: name.to_string(),
        })
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.backend.cache_names()
    }

    pub fn has(&self, name: &str) -> Result<bool> {
        Ok(self.keys()?.iter().any(|k| k == name))
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.backend.delete(name)
    }
}

/// Handle to one named cache.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    name: String,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached response for exactly this request, if any.
    pub fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        self.backend.get(&self.name, &CacheKey::from(request))
    }

    pub fn contains(&self, request: &Request) -> Result<bool> {
        Ok(self.match_request(request)?.is_some())
    }

    pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
        self.backend.put(&self.name, &CacheKey::from(request), response)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.entry_count(&self.name)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_and_keys_lists() {
        let storage = CacheStorage::in_memory();
        storage.open("quran-v2").unwrap();
        storage.open("quran-v1").unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["quran-v1", "quran-v2"]);
    }

    #[test]
    fn keyed_by_method_and_url() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("c").unwrap();
        let get = Request::get("https://reader.invalid/a");
        let head = Request {
            method: Method::Head,
            url: get.url.clone(),
        };
        cache.put(&get, &Response::new(200, "body")).unwrap();
        assert!(cache.contains(&get).unwrap());
        assert!(!cache.contains(&head).unwrap());
        assert!(!cache.contains(&Request::get("https://reader.invalid/b")).unwrap());
    }

    #[test]
    fn handles_share_entries() {
        let storage = CacheStorage::in_memory();
        let a = storage.open("c").unwrap();
        let b = storage.clone().open("c").unwrap();
        let req = Request::get("https://reader.invalid/x");
        a.put(&req, &Response::new(200, "x")).unwrap();
        assert_eq!(b.match_request(&req).unwrap().unwrap().body, b"x");
        assert_eq!(b.len().unwrap(), 1);
    }

    #[test]
    fn delete_removes_entries() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("old").unwrap();
        cache.put(&Request::get("u"), &Response::new(200, "x")).unwrap();
        assert!(storage.delete("old").unwrap());
        assert!(!storage.delete("old").unwrap());
        assert!(storage.keys().unwrap().is_empty());
        assert_eq!(cache.len().unwrap(), 0);
        // Purged caches are not resurrected by stale handles
        assert!(cache.put(&Request::get("u"), &Response::new(200, "x")).is_err());
        assert!(storage.keys().unwrap().is_empty());
    }
}
