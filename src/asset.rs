//! Page asset identity: tiers, retrieval paths, and resource classes.
//!
//! A page asset is `(page, tier)` and maps to
//! `images/pages/<tier>/<page>.<ext>` relative to the site base URL.
//! Page numbers are 1-based and never zero-padded.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default image extension for pre-generated page tiers.
pub const DEFAULT_IMAGE_EXT: &str = "webp";

/// Path segment that marks a page image request.
const PAGE_IMAGE_SEGMENT: &str = "images/pages/";

/// Pre-generated fidelity level of a page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Thumb,
    Medium,
    High,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Thumb, Tier::Medium, Tier::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Thumb => "thumb",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown tier '{s}' (expected thumb, medium or high)"))
    }
}

/// Identity of one page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetId {
    pub page: u32,
    pub tier: Tier,
}

impl AssetId {
    pub fn new(page: u32, tier: Tier) -> Self {
        Self { page, tier }
    }

    /// Site-relative retrieval path, e.g. `images/pages/medium/12.webp`.
    pub fn path(&self, ext: &str) -> String {
        format!("{PAGE_IMAGE_SEGMENT}{}/{}.{ext}", self.tier, self.page)
    }
}

/// `images/pages/<tier>/<page>.<ext>` at the end of a URL path.
/// Zero-padded page numbers are rejected.
static ASSET_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|/)images/pages/(thumb|medium|high)/([1-9][0-9]*)\.[A-Za-z0-9]+$").unwrap()
});

/// Strip scheme/host, query and fragment, leaving the path component.
fn url_path(url: &str) -> &str {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    match url.find("://") {
        Some(i) => {
            let rest = &url[i + 3..];
            rest.find('/').map_or("/", |j| &rest[j..])
        }
        None => url,
    }
}

/// Parse a page asset out of a URL or site-relative path.
pub fn parse_asset_path(url: &str) -> Option<AssetId> {
    let caps = ASSET_PATH_RE.captures(url_path(url))?;
    let tier = caps[1].parse().ok()?;
    let page = caps[2].parse().ok()?;
    Some(AssetId { page, tier })
}

/// Resource class that decides the caching strategy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    /// Immutable page image under `images/pages/`.
    PageImage,
    /// Markup, scripts, styles, metadata, icons.
    Shell,
}

/// Classify a request URL by its path.
pub fn classify(url: &str) -> ResourceClass {
    let path = url_path(url);
    let path = path.trim_start_matches("./");
    if path.starts_with(PAGE_IMAGE_SEGMENT) || path.contains(&format!("/{PAGE_IMAGE_SEGMENT}")) {
        ResourceClass::PageImage
    } else {
        ResourceClass::Shell
    }
}

/// Clamp a page number into `[1, total_pages]`.
pub fn clamp_page(page: i64, total_pages: u32) -> u32 {
    page.clamp(1, i64::from(total_pages.max(1))) as u32
}

/// Where the site lives and how page images are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    base_url: String,
    image_ext: String,
}

impl SiteLayout {
    pub fn new(base_url: &str, image_ext: &str) -> Self {
        let base_url = format!("{}/", base_url.trim_end_matches('/'));
        Self {
            base_url,
            image_ext: image_ext.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn image_ext(&self) -> &str {
        &self.image_ext
    }

    /// Resolve a site-relative path (`./index.html`, `/css/a.css`, `js/app.js`)
    /// against the base URL. Absolute URLs pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.contains("://") {
            return path.to_string();
        }
        let mut rel = path;
        loop {
            if let Some(r) = rel.strip_prefix("./") {
                rel = r;
            } else if let Some(r) = rel.strip_prefix('/') {
                rel = r;
            } else {
                break;
            }
        }
        if rel == "." {
            rel = "";
        }
        format!("{}{rel}", self.base_url)
    }

    /// Absolute URL of a page asset.
    pub fn asset_url(&self, asset: AssetId) -> String {
        self.url(&asset.path(&self.image_ext))
    }
}
