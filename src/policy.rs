//! Caching policy as pure functions.
//!
//! | class        | strategy      |
//! |--------------|---------------|
//! | page images  | cache-first   |
//! | shell        | network-first |
//!
//! Each strategy maps (cached entry, network outcome) to the response to
//! return and the cache mutation to apply. The gateway performs the I/O;
//! these functions only decide.

use anyhow::Result;

use crate::asset::{ResourceClass, classify};
use crate::net::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
}

pub fn strategy_for(request: &Request) -> Strategy {
    match classify(&request.url) {
        ResourceClass::PageImage => Strategy::CacheFirst,
        ResourceClass::Shell => Strategy::NetworkFirst,
    }
}

/// Cache change to apply after answering a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMutation {
    None,
    Store(Response),
}

/// Where the returned response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Cache,
    Network,
    /// Nothing could be served; `response` is an error.
    Nothing,
}

pub struct Decision {
    pub response: Result<Response>,
    pub mutation: CacheMutation,
    pub served: Served,
}

/// Store successful responses only; error statuses pass through uncached.
fn store_if_ok(resp: &Response) -> CacheMutation {
    if resp.ok() {
        CacheMutation::Store(resp.clone())
    } else {
        CacheMutation::None
    }
}

/// Serve a cached copy if present; consult the network only on a miss.
pub fn cache_first(cached: Option<Response>, network: impl FnOnce() -> Result<Response>) -> Decision {
    if let Some(resp) = cached {
        return Decision {
            response: Ok(resp),
            mutation: CacheMutation::None,
            served: Served::Cache,
        };
    }
    match network() {
        Ok(resp) => Decision {
            mutation: store_if_ok(&resp),
            response: Ok(resp),
            served: Served::Network,
        },
        Err(e) => Decision {
            response: Err(e.context("not cached and network unavailable")),
            mutation: CacheMutation::None,
            served: Served::Nothing,
        },
    }
}

/// Always try the network; fall back to the cache only if it fails.
pub fn network_first(network: Result<Response>, cached: impl FnOnce() -> Option<Response>) -> Decision {
    match network {
        Ok(resp) => Decision {
            mutation: store_if_ok(&resp),
            response: Ok(resp),
            served: Served::Network,
        },
        Err(e) => match cached() {
            Some(resp) => Decision {
                response: Ok(resp),
                mutation: CacheMutation::None,
                served: Served::Cache,
            },
            None => Decision {
                response: Err(e.context("network unavailable and no cached fallback")),
                mutation: CacheMutation::None,
                served: Served::Nothing,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> Result<Response> {
        Err(anyhow::anyhow!("connection refused"))
    }

    #[test]
    fn strategy_table() {
        assert_eq!(
            strategy_for(&Request::get("https://r.invalid/images/pages/medium/1.webp")),
            Strategy::CacheFirst
        );
        for shell in ["https://r.invalid/", "https://r.invalid/index.html", "https://r.invalid/data/metadata.json"] {
            assert_eq!(strategy_for(&Request::get(shell)), Strategy::NetworkFirst, "{shell}");
        }
    }

    #[test]
    fn cache_first_hit_skips_network() {
        let d = cache_first(Some(Response::new(200, "cached")), || panic!("network consulted"));
        assert_eq!(d.response.unwrap().body, b"cached");
        assert_eq!(d.mutation, CacheMutation::None);
        assert_eq!(d.served, Served::Cache);
    }

    #[test]
    fn cache_first_miss_stores_ok() {
        let d = cache_first(None, || Ok(Response::new(200, "fresh")));
        assert_eq!(d.mutation, CacheMutation::Store(Response::new(200, "fresh")));
        assert_eq!(d.served, Served::Network);
    }

    #[test]
    fn cache_first_miss_does_not_store_error_status() {
        let d = cache_first(None, || Ok(Response::new(404, "nope")));
        assert_eq!(d.response.unwrap().status, 404);
        assert_eq!(d.mutation, CacheMutation::None);
    }

    #[test]
    fn cache_first_miss_offline_fails() {
        let d = cache_first(None, offline);
        assert!(d.response.is_err());
        assert_eq!(d.served, Served::Nothing);
    }

    #[test]
    fn network_first_prefers_network_and_refreshes() {
        let d = network_first(Ok(Response::new(200, "v2")), || Some(Response::new(200, "v1")));
        assert_eq!(d.response.unwrap().body, b"v2");
        assert_eq!(d.mutation, CacheMutation::Store(Response::new(200, "v2")));
    }

    #[test]
    fn network_first_error_status_is_not_a_fallback_trigger() {
        let d = network_first(Ok(Response::new(503, "busy")), || Some(Response::new(200, "v1")));
        assert_eq!(d.response.unwrap().status, 503);
        assert_eq!(d.mutation, CacheMutation::None);
    }

    #[test]
    fn network_first_offline_falls_back() {
        let d = network_first(offline(), || Some(Response::new(200, "v1")));
        assert_eq!(d.response.unwrap().body, b"v1");
        assert_eq!(d.served, Served::Cache);
    }

    #[test]
    fn network_first_offline_without_cache_fails() {
        let d = network_first(offline(), || None);
        let err = d.response.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
