#![no_main]

use libfuzzer_sys::fuzz_target;
use mushaf::asset::{ResourceClass, SiteLayout, classify, parse_asset_path};

fuzz_target!(|data: &[u8]| {
    let Ok(url) = std::str::from_utf8(data) else {
        return;
    };

    // Must not panic on arbitrary input.
    let class = classify(url);
    let Some(asset) = parse_asset_path(url) else {
        return;
    };

    // Anything that parses as a page asset is cached as one.
    assert_eq!(class, ResourceClass::PageImage, "{url:?} parsed but classified as shell");
    assert!(asset.page >= 1);

    // The canonical URL of the parsed asset parses back to the same asset.
    let layout = SiteLayout::new("https://fuzz.invalid/app", "webp");
    let canonical = layout.asset_url(asset);
    assert_eq!(parse_asset_path(&canonical), Some(asset), "{canonical}");
});
