//! Mushaf metadata document (`data/metadata.json`).

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Deserialize;

use crate::context::FALLBACK_TOTAL_PAGES;
use crate::net::{Fetcher, Request};

/// Site-relative path of the metadata document.
pub const METADATA_PATH: &str = "data/metadata.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mushaf {
    #[serde(default)]
    pub total_pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Juz {
    pub number: u32,
    pub start_page: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub mushaf: Mushaf,
    /// Sorted by `start_page`.
    #[serde(default)]
    pub juz: Vec<Juz>,
    /// Kept opaque; only passed through to the host.
    #[serde(default)]
    pub surahs: Vec<serde_json::Value>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            mushaf: Mushaf {
                total_pages: FALLBACK_TOTAL_PAGES,
            },
            juz: Vec::new(),
            surahs: Vec::new(),
        }
    }
}

impl Metadata {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut meta: Metadata =
            serde_json::from_slice(bytes).context("failed to parse metadata document")?;
        if meta.mushaf.total_pages == 0 {
            meta.mushaf.total_pages = FALLBACK_TOTAL_PAGES;
        }
        meta.juz.sort_by_key(|j| j.start_page);
        Ok(meta)
    }

    /// Fetch and parse `url`. Any failure yields the fallback document so
    /// navigation keeps working.
    pub fn load(fetcher: &dyn Fetcher, url: &str) -> Self {
        let fetched = fetcher.fetch(&Request::get(url)).and_then(|resp| {
            if !resp.ok() {
                bail!("HTTP {}", resp.status);
            }
            Self::parse(&resp.body)
        });
        match fetched {
            Ok(meta) => {
                info!(
                    "metadata: {} pages, {} juz, {} surahs",
                    meta.total_pages(),
                    meta.juz.len(),
                    meta.surahs.len()
                );
                meta
            }
            Err(e) => {
                warn!("metadata: failed to load {url}: {e:#}, assuming {FALLBACK_TOTAL_PAGES} pages");
                Self::default()
            }
        }
    }

    pub fn total_pages(&self) -> u32 {
        self.mushaf.total_pages
    }

    /// The juz containing `page`: the last one starting at or before it.
    /// Pages before the first listed juz map to the first one.
    pub fn juz_for_page(&self, page: u32) -> Option<&Juz> {
        let idx = self.juz.partition_point(|j| j.start_page <= page);
        self.juz.get(idx.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Response;

    const DOC: &str = r#"{
        "mushaf": { "totalPages": 604 },
        "juz": [
            { "number": 2, "startPage": 22 },
            { "number": 1, "startPage": 1 },
            { "number": 3, "startPage": 42 }
        ],
        "surahs": [{ "number": 1, "startPage": 1 }]
    }"#;

    struct Serve(Result<Response, &'static str>);

    impl Fetcher for Serve {
        fn fetch(&self, _: &Request) -> Result<Response> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[test]
    fn parse_document() {
        let meta = Metadata::parse(DOC.as_bytes()).unwrap();
        assert_eq!(meta.total_pages(), 604);
        assert_eq!(meta.juz[0].number, 1, "sorted by start page");
        assert_eq!(meta.surahs.len(), 1);
    }

    #[test]
    fn juz_lookup() {
        let meta = Metadata::parse(DOC.as_bytes()).unwrap();
        assert_eq!(meta.juz_for_page(1).unwrap().number, 1);
        assert_eq!(meta.juz_for_page(21).unwrap().number, 1);
        assert_eq!(meta.juz_for_page(22).unwrap().number, 2);
        assert_eq!(meta.juz_for_page(600).unwrap().number, 3);
        assert!(Metadata::default().juz_for_page(5).is_none());
    }

    #[test]
    fn zero_total_pages_falls_back() {
        let meta = Metadata::parse(br#"{"mushaf":{"totalPages":0}}"#).unwrap();
        assert_eq!(meta.total_pages(), 847);
    }

    #[test]
    fn load_falls_back_on_any_failure() {
        let url = "https://r.invalid/data/metadata.json";
        assert_eq!(Metadata::load(&Serve(Err("offline")), url).total_pages(), 847);
        assert_eq!(
            Metadata::load(&Serve(Ok(Response::new(500, ""))), url).total_pages(),
            847
        );
        assert_eq!(
            Metadata::load(&Serve(Ok(Response::new(200, "{not json"))), url).total_pages(),
            847
        );
        assert_eq!(
            Metadata::load(&Serve(Ok(Response::new(200, DOC))), url).total_pages(),
            604
        );
    }
}
