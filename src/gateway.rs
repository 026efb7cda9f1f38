//! Cache gateway: answers every request the foreground makes.
//!
//! Lifecycle:
//!   1. install  — fetch the whole shell manifest; commit only if every
//!                 file arrived with a 2xx status
//!   2. activate — delete every cache name except the current version
//!   3. fetch    — per-request policy (see [`crate::policy`])
//!
//! A [`Gateway`] value only exists after a successful install.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use crate::net::{Fetcher, Method, Request, Response};
use crate::policy::{self, CacheMutation, Strategy, strategy_for};
use crate::store::{Cache, CacheStorage};

pub struct Gateway {
    storage: CacheStorage,
    cache: Cache,
    fetcher: Arc<dyn Fetcher>,
}

impl Gateway {
    /// Install a cache version: fetch all `shell_urls` concurrently and
    /// commit them to `cache_name`.
    ///
    /// Fails without committing anything if any shell file fails to fetch or
    /// returns a non-2xx status.
    pub fn install(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        cache_name: &str,
        shell_urls: &[String],
    ) -> Result<Self> {
        let start = Instant::now();
        info!("gateway: installing {cache_name} ({} shell files)", shell_urls.len());

        let fetched: Vec<(Request, Result<Response>)> = thread::scope(|s| {
            let handles: Vec<_> = shell_urls
                .iter()
                .map(|url| {
                    let fetcher = &fetcher;
                    let req = Request::get(url.as_str());
                    s.spawn(move || {
                        let resp = fetcher.fetch(&req);
                        (req, resp)
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(shell_urls)
                .map(|(h, url)| {
                    h.join().unwrap_or_else(|_| {
                        (Request::get(url.as_str()), Err(anyhow::anyhow!("shell fetch panicked")))
                    })
                })
                .collect()
        });

        let mut shell = Vec::with_capacity(fetched.len());
        for (req, resp) in fetched {
            let resp = resp.with_context(|| format!("install failed: could not fetch {}", req.url))?;
            if !resp.ok() {
                bail!("install failed: {} returned status {}", req.url, resp.status);
            }
            shell.push((req, resp));
        }

        let existed = storage.has(cache_name)?;
        let cache = storage.open(cache_name)?;
        for (req, resp) in &shell {
            if let Err(e) = cache.put(req, resp) {
                if !existed {
                    let _ = storage.delete(cache_name);
                }
                return Err(e.context(format!("install failed: could not store {}", req.url)));
            }
        }

        info!(
            "gateway: installed {cache_name} in {:.1}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Self {
            storage,
            cache,
            fetcher,
        })
    }

    /// Reattach to a version committed by an earlier install. Returns `None`
    /// if `cache_name` is not in storage.
    pub fn resume(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        cache_name: &str,
    ) -> Result<Option<Self>> {
        if !storage.has(cache_name)? {
            return Ok(None);
        }
        let cache = storage.open(cache_name)?;
        info!("gateway: resumed {cache_name} ({} entries)", cache.len()?);
        Ok(Some(Self {
            storage,
            cache,
            fetcher,
        }))
    }

    /// Purge every cache version other than the current one.
    /// Returns the deleted names.
    ///
    /// A stale cache that cannot be deleted stays behind with a warning and
    /// is retried on the next activation; serving from the current version
    /// does not depend on it.
    pub fn activate(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.storage.keys()? {
            if name == self.cache.name() {
                continue;
            }
            match self.storage.delete(&name) {
                Ok(_) => {
                    info!("gateway: deleted stale cache {name}");
                    deleted.push(name);
                }
                Err(e) => warn!("gateway: failed to delete stale cache {name}: {e:#}"),
            }
        }
        info!("gateway: activated {}", self.cache.name());
        Ok(deleted)
    }

    /// The current cache version.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Answer one request according to its resource class.
    pub fn handle_fetch(&self, request: &Request) -> Result<Response> {
        if request.method != Method::Get {
            debug!("gateway: {} {} passed through", request.method, request.url);
            return self.fetcher.fetch(request);
        }

        let strategy = strategy_for(request);
        let decision = match strategy {
            Strategy::CacheFirst => {
                policy::cache_first(self.lookup(request), || self.fetcher.fetch(request))
            }
            Strategy::NetworkFirst => {
                policy::network_first(self.fetcher.fetch(request), || self.lookup(request))
            }
        };
        debug!(
            "gateway: {} {:?} served from {:?}",
            request.url, strategy, decision.served
        );
        if let CacheMutation::Store(resp) = &decision.mutation {
            self.store(request, resp);
        }
        decision.response
    }

    /// Cache lookup that treats storage errors as a miss.
    fn lookup(&self, request: &Request) -> Option<Response> {
        match self.cache.match_request(request) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("gateway: cache read failed for {}: {e:#}", request.url);
                None
            }
        }
    }

    /// Opportunistic write. Storage exhaustion degrades to "not cached".
    fn store(&self, request: &Request, response: &Response) {
        if let Err(e) = self.cache.put(request, response) {
            warn!("gateway: could not cache {}: {e:#}", request.url);
        }
    }
}
