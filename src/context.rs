//! Foreground application context, resolved once from configuration and
//! handed to the viewport loader.

use serde::Deserialize;

use crate::asset::{SiteLayout, Tier};

/// Pages prefetched on each side of the current page.
pub const DEFAULT_PRELOAD_RANGE: u32 = 5;

/// Page count used when the metadata document is unavailable.
pub const FALLBACK_TOTAL_PAGES: u32 = 847;

/// Dual-page (spread) display preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DualPage {
    /// The host decides (e.g. landscape orientation).
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct AppContext {
    pub layout: SiteLayout,
    pub total_pages: u32,
    /// Tier shown for normal reading once loaded.
    pub reading_tier: Tier,
    pub dual_page: DualPage,
    pub preload_range: u32,
}

impl AppContext {
    /// Pages advanced per next/prev step.
    pub fn page_step(&self) -> u32 {
        if self.dual_page == DualPage::On { 2 } else { 1 }
    }
}
