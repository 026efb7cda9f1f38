//! Requests, responses, and the network seam.
//!
//! Everything above this module talks to the network through [`Fetcher`],
//! so the gateway and the bulk sync run unchanged against `ureq` in the
//! binary and against in-process fakes in tests.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Request method. Only idempotent reads are intercepted and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Head => f.write_str("HEAD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub method: Method,
    pub url: String,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
        }
    }
}

/// A fully buffered response. Cached entries are stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// 2xx status.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The network as seen by the gateway and the bulk sync.
///
/// `Err` means the request never produced a response (DNS, connection,
/// timeout). Non-2xx statuses are returned as `Ok` responses.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Blocking HTTP fetcher backed by a shared `ureq` agent.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    /// `timeout` of `None` waits indefinitely, matching the browser fetch
    /// the gateway was modelled on.
    pub fn new(timeout: Option<Duration>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout)
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: &Request) -> Result<Response> {
        let start = Instant::now();
        let call = match request.method {
            Method::Get => self.agent.get(&request.url).call(),
            Method::Head => self.agent.head(&request.url).call(),
        };
        let mut resp = call.with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = if request.method == Method::Head {
            Vec::new()
        } else {
            resp.body_mut()
                .read_to_vec()
                .with_context(|| format!("failed to read body of {}", request.url))?
        };
        debug!(
            "net: {} {} -> {status} ({} bytes) in {:.1}ms",
            request.method,
            request.url,
            body.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        trace!("net: headers for {}: {:?}", request.url, headers);
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_2xx_only() {
        assert!(Response::new(200, "x").ok());
        assert!(Response::new(204, "").ok());
        assert!(!Response::new(304, "").ok());
        assert!(!Response::new(404, "").ok());
        assert!(!Response::new(500, "").ok());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut resp = Response::new(200, "x");
        resp.headers.push(("Content-Type".into(), "image/webp".into()));
        assert_eq!(resp.header("content-type"), Some("image/webp"));
        assert_eq!(resp.header("etag"), None);
    }

    #[test]
    fn method_display() {
        assert_eq!(Request::get("a").method.to_string(), "GET");
        assert_eq!(Method::Head.to_string(), "HEAD");
    }
}
