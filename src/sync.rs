//! Bulk sync: mirror every page of one tier into the cache.
//!
//! Pages are processed in contiguous batches. Inside a batch every page runs
//! on its own scoped thread; batch N+1 starts only after batch N has fully
//! settled, which bounds concurrency and keeps progress counts monotonic.
//!
//! Per-page failures never abort anything: they become the `errors` counter.
//! Already-cached pages are counted as downloaded without touching the
//! network, so re-running a partially failed sync is the retry mechanism.

use std::ops::RangeInclusive;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::asset::{AssetId, SiteLayout, Tier};
use crate::net::{Fetcher, Request};
use crate::protocol::WorkerMessage;
use crate::store::Cache;

/// Pages fetched concurrently per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageOutcome {
    /// Already in the cache; no network call was made.
    Cached,
    /// Fetched with a 2xx status and stored.
    Stored,
    Failed,
}

/// Counters for one download-all invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSession {
    pub total: u32,
    pub downloaded: u32,
    pub errors: u32,
    /// Subset of `downloaded` satisfied from the cache.
    pub cache_hits: u32,
}

impl DownloadSession {
    fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Cached => {
                self.downloaded += 1;
                self.cache_hits += 1;
            }
            PageOutcome::Stored => self.downloaded += 1,
            PageOutcome::Failed => self.errors += 1,
        }
    }

    pub fn progress(&self) -> WorkerMessage {
        WorkerMessage::DownloadProgress {
            downloaded: self.downloaded,
            total: self.total,
            errors: self.errors,
        }
    }

    pub fn completion(&self) -> WorkerMessage {
        WorkerMessage::DownloadComplete {
            downloaded: self.downloaded,
            total: self.total,
            errors: self.errors,
        }
    }
}

/// Batched downloader over a shared cache.
pub struct BulkSync<'a> {
    pub cache: &'a Cache,
    pub fetcher: &'a dyn Fetcher,
    pub layout: &'a SiteLayout,
    pub batch_size: usize,
}

impl BulkSync<'_> {
    /// Download pages `1..=total_pages` of `tier`, reporting to `reply`.
    ///
    /// Sends one progress message per settled batch and exactly one
    /// completion message at the end. A closed `reply` channel does not
    /// stop the session.
    pub fn download_all(
        &self,
        total_pages: u32,
        tier: Tier,
        reply: &mpsc::Sender<WorkerMessage>,
    ) -> DownloadSession {
        let start = Instant::now();
        let batch_size = self.batch_size.max(1);
        let span = u32::try_from(batch_size - 1).unwrap_or(u32::MAX);
        let mut session = DownloadSession::new(total_pages);
        let mut requester_gone = false;
        info!(
            "sync: downloading {total_pages} {tier} pages into {} (batch size {batch_size})",
            self.cache.name()
        );

        for (batch_idx, first) in (1..=total_pages).step_by(batch_size).enumerate() {
            let batch = first..=first.saturating_add(span).min(total_pages);
            let batch_start = Instant::now();
            let outcomes = self.run_batch(batch.clone(), tier);
            for outcome in outcomes {
                session.record(outcome);
            }
            debug!(
                "sync: batch {batch_idx} (pages {}..={}) settled in {:.1}ms: downloaded={}, errors={}",
                batch.start(),
                batch.end(),
                batch_start.elapsed().as_secs_f64() * 1000.0,
                session.downloaded,
                session.errors
            );
            if reply.send(session.progress()).is_err() && !requester_gone {
                debug!("sync: requester went away, continuing without progress reports");
                requester_gone = true;
            }
        }

        let _ = reply.send(session.completion());
        info!(
            "sync: complete in {:.1}ms: downloaded={}/{} ({} from cache), errors={}",
            start.elapsed().as_secs_f64() * 1000.0,
            session.downloaded,
            session.total,
            session.cache_hits,
            session.errors
        );
        session
    }

    /// Run one batch concurrently and wait for every page to settle.
    fn run_batch(&self, batch: RangeInclusive<u32>, tier: Tier) -> Vec<PageOutcome> {
        thread::scope(|s| {
            let handles: Vec<_> = batch
                .map(|page| s.spawn(move || self.sync_page(AssetId::new(page, tier))))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(PageOutcome::Failed))
                .collect()
        })
    }

    fn sync_page(&self, asset: AssetId) -> PageOutcome {
        let request = Request::get(self.layout.asset_url(asset));
        match self.cache.match_request(&request) {
            Ok(Some(_)) => return PageOutcome::Cached,
            Ok(None) => {}
            Err(e) => warn!("sync: cache read failed for {}: {e:#}", request.url),
        }
        match self.fetcher.fetch(&request) {
            Ok(resp) if resp.ok() => match self.cache.put(&request, &resp) {
                Ok(()) => PageOutcome::Stored,
                Err(e) => {
                    warn!("sync: could not store page {}: {e:#}", asset.page);
                    PageOutcome::Failed
                }
            },
            Ok(resp) => {
                debug!("sync: page {} returned status {}", asset.page, resp.status);
                PageOutcome::Failed
            }
            Err(e) => {
                debug!("sync: page {} failed: {e:#}", asset.page);
                PageOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Response;
    use crate::store::CacheStorage;
    use anyhow::{Result, bail};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves every page except those listed in `failing`.
    struct Pages {
        failing: Vec<u32>,
        calls: AtomicUsize,
    }

    impl Pages {
        fn new(failing: &[u32]) -> Self {
            Self {
                failing: failing.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Fetcher for Pages {
        fn fetch(&self, request: &Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let asset = crate::asset::parse_asset_path(&request.url)
                .ok_or_else(|| anyhow::anyhow!("not a page: {}", request.url))?;
            if self.failing.contains(&asset.page) {
                bail!("connection reset");
            }
            Ok(Response::new(200, format!("page {}", asset.page)))
        }
    }

    fn run(cache: &Cache, fetcher: &dyn Fetcher, total: u32) -> (DownloadSession, Vec<WorkerMessage>) {
        let layout = SiteLayout::new("https://r.invalid", "webp");
        let sync = BulkSync {
            cache,
            fetcher,
            layout: &layout,
            batch_size: DEFAULT_BATCH_SIZE,
        };
        let (tx, rx) = mpsc::channel();
        let session = sync.download_all(total, Tier::Medium, &tx);
        drop(tx);
        (session, rx.iter().collect())
    }

    #[test]
    fn one_progress_per_batch_then_completion() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (session, msgs) = run(&cache, &Pages::new(&[]), 25);
        assert_eq!(msgs.len(), 3 + 1);
        assert_eq!(
            msgs[0],
            WorkerMessage::DownloadProgress { downloaded: 10, total: 25, errors: 0 }
        );
        assert_eq!(
            msgs[2],
            WorkerMessage::DownloadProgress { downloaded: 25, total: 25, errors: 0 }
        );
        assert_eq!(
            msgs[3],
            WorkerMessage::DownloadComplete { downloaded: 25, total: 25, errors: 0 }
        );
        assert_eq!(session.downloaded, 25);
        assert_eq!(cache.len().unwrap(), 25);
    }

    #[test]
    fn failures_are_counted_not_propagated() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (session, msgs) = run(&cache, &Pages::new(&[3, 17]), 20);
        assert_eq!((session.downloaded, session.errors), (18, 2));
        assert_eq!(msgs.last().unwrap().counts(), (18, 20, 2));
    }

    #[test]
    fn progress_is_monotonic_and_reaches_total() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (_, msgs) = run(&cache, &Pages::new(&[1, 2, 30, 41]), 43);
        let mut last = 0;
        for msg in &msgs {
            let (d, _, e) = msg.counts();
            assert!(d + e >= last);
            last = d + e;
        }
        assert_eq!(last, 43);
        assert_eq!(msgs.iter().filter(|m| m.is_complete()).count(), 1);
        assert!(msgs.last().unwrap().is_complete());
    }

    #[test]
    fn rerun_is_served_from_cache() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (first, _) = run(&cache, &Pages::new(&[7]), 30);
        assert_eq!(first.errors, 1);

        let healed = Pages::new(&[]);
        let (second, _) = run(&cache, &healed, 30);
        assert_eq!((second.downloaded, second.errors), (30, 0));
        assert_eq!(second.cache_hits, 29);
        assert_eq!(healed.calls.load(Ordering::SeqCst), 1, "only page 7 refetched");
    }

    #[test]
    fn non_ok_status_is_an_error() {
        struct NotFound;
        impl Fetcher for NotFound {
            fn fetch(&self, _: &Request) -> Result<Response> {
                Ok(Response::new(404, ""))
            }
        }
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (session, _) = run(&cache, &NotFound, 4);
        assert_eq!((session.downloaded, session.errors), (0, 4));
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn panicking_fetch_counts_as_error() {
        struct Panics;
        impl Fetcher for Panics {
            fn fetch(&self, request: &Request) -> Result<Response> {
                if request.url.ends_with("/2.webp") {
                    panic!("boom");
                }
                Ok(Response::new(200, "ok"))
            }
        }
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (session, _) = run(&cache, &Panics, 3);
        assert_eq!((session.downloaded, session.errors), (2, 1));
    }

    #[test]
    fn closed_reply_channel_does_not_stop_session() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let layout = SiteLayout::new("https://r.invalid", "webp");
        let fetcher = Pages::new(&[]);
        let sync = BulkSync {
            cache: &cache,
            fetcher: &fetcher,
            layout: &layout,
            batch_size: 4,
        };
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let session = sync.download_all(9, Tier::Thumb, &tx);
        assert_eq!(session.downloaded, 9);
        assert_eq!(cache.len().unwrap(), 9);
    }

    /// Records how many fetches overlap and when each page starts and ends.
    #[derive(Default)]
    struct Tracking {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        clock: AtomicUsize,
        /// page -> (start tick, finish tick)
        ticks: std::sync::Mutex<std::collections::HashMap<u32, (usize, usize)>>,
    }

    impl Fetcher for Tracking {
        fn fetch(&self, request: &Request) -> Result<Response> {
            let page = crate::asset::parse_asset_path(&request.url)
                .ok_or_else(|| anyhow::anyhow!("not a page: {}", request.url))?
                .page;
            let started = self.clock.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let finished = self.clock.fetch_add(1, Ordering::SeqCst);
            self.ticks.lock().unwrap().insert(page, (started, finished));
            Ok(Response::new(200, format!("page {page}")))
        }
    }

    #[test]
    fn batches_run_concurrently_and_in_sequence() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let fetcher = Tracking::default();
        let (session, msgs) = run(&cache, &fetcher, 35);
        assert_eq!(session.downloaded, 35);
        assert_eq!(msgs.len(), 4 + 1);

        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "pages within a batch must overlap, peak was {peak}");
        assert!(peak <= DEFAULT_BATCH_SIZE, "at most one batch in flight, peak was {peak}");

        let ticks = fetcher.ticks.lock().unwrap();
        assert_eq!(ticks.len(), 35);
        let pages: Vec<u32> = (1..=35).collect();
        let batches: Vec<&[u32]> = pages.chunks(DEFAULT_BATCH_SIZE).collect();
        for pair in batches.windows(2) {
            let settled = pair[0].iter().map(|p| ticks[p].1).max().unwrap();
            let next_start = pair[1].iter().map(|p| ticks[p].0).min().unwrap();
            assert!(
                next_start > settled,
                "page {} started before batch ending at page {} settled",
                pair[1][0],
                pair[0][pair[0].len() - 1]
            );
        }
    }

    #[test]
    fn last_batch_is_partial() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let layout = SiteLayout::new("https://r.invalid", "webp");
        let fetcher = Pages::new(&[]);
        let sync = BulkSync {
            cache: &cache,
            fetcher: &fetcher,
            layout: &layout,
            batch_size: 4,
        };
        let (tx, rx) = mpsc::channel();
        sync.download_all(10, Tier::High, &tx);
        drop(tx);
        let counts: Vec<_> = rx.iter().map(|m| m.counts().0).collect();
        assert_eq!(counts, vec![4, 8, 10, 10]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn zero_pages_completes_immediately() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("v").unwrap();
        let (session, msgs) = run(&cache, &Pages::new(&[]), 0);
        assert_eq!(session, DownloadSession::default());
        assert_eq!(
            msgs,
            vec![WorkerMessage::DownloadComplete { downloaded: 0, total: 0, errors: 0 }]
        );
    }
}
