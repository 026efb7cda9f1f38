//! Viewport loader: progressive page display.
//!
//! Each render shows the thumbnail tier at once (marked degraded), then
//! swaps in the reading tier when it arrives. Loads run on a small worker
//! pool; their completions come back over a channel and are applied by
//! [`ViewportLoader::poll`] on the caller's thread.
//!
//! Staleness:
//!   Every render bumps the [`Generation`]. A completion carries the
//!   generation it was issued under and is dropped unless that is still the
//!   current one, so a slow load for page N can never overwrite page M.
//!   The fetch itself is not cancelled and still warms the cache.
//!
//! Prefetch:
//!   Neighbour pages go to a separate pool so they never queue ahead of the
//!   visible page. Their results are discarded.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, trace};

use crate::asset::{AssetId, Tier, clamp_page};
use crate::context::{AppContext, DualPage};
use crate::net::{Fetcher, Request};

/// Default number of threads per load pool.
pub const DEFAULT_LOADER_WORKERS: usize = 4;

/// Zoom scale above which the primary slot is promoted to the high tier.
const ZOOM_PROMOTE_ABOVE: f64 = 1.5;
/// Zoom scale at or below which the primary slot returns to the reading tier.
const ZOOM_RESET_AT: f64 = 1.05;
const ZOOM_MIN: f64 = 1.0;
const ZOOM_MAX: f64 = 4.0;

/// Monotonic render counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    fn bump(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary,
    /// Right-hand page of a spread.
    Secondary,
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => 1,
        }
    }
}

/// The host's image slots.
pub trait Display {
    /// Point `slot` at `url`. `degraded` marks a placeholder tier.
    fn set_source(&mut self, slot: Slot, url: &str, degraded: bool);
    fn hide(&mut self, slot: Slot);
}

/// Result of a prefetch. Carries nothing: prefetching only warms the cache.
#[derive(Debug)]
pub struct BestEffort;

fn best_effort(url: &str, result: Result<crate::net::Response>) -> BestEffort {
    match result {
        Ok(resp) => trace!("viewport: prefetched {url} ({})", resp.status),
        Err(e) => trace!("viewport: prefetch of {url} failed: {e:#}"),
    }
    BestEffort
}

// ---------------------------------------------------------------------------
// Load pool
// ---------------------------------------------------------------------------

enum LoadKind {
    Target { generation: Generation, slot: Slot, asset: AssetId },
    Prefetch,
}

struct LoadJob {
    url: String,
    kind: LoadKind,
}

/// A finished target load.
struct Completion {
    generation: Generation,
    slot: Slot,
    asset: AssetId,
    url: String,
    loaded: bool,
}

/// Fixed set of threads pulling jobs from one queue.
///
/// Dropping the pool closes the queue; threads finish their current job and
/// exit without being joined.
struct LoadPool {
    jobs: mpsc::Sender<LoadJob>,
}

impl LoadPool {
    fn new(
        name: &str,
        size: usize,
        fetcher: Arc<dyn Fetcher>,
        done: mpsc::Sender<Completion>,
    ) -> Result<Self> {
        let (jobs, rx) = mpsc::channel::<LoadJob>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let fetcher = Arc::clone(&fetcher);
            let done = done.clone();
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || load_worker(&rx, fetcher.as_ref(), &done))
                .with_context(|| format!("failed to spawn {name} thread"))?;
        }
        Ok(Self { jobs })
    }

    fn submit(&self, job: LoadJob) {
        if self.jobs.send(job).is_err() {
            debug!("viewport: load pool is gone, job dropped");
        }
    }
}

fn load_worker(
    rx: &Mutex<mpsc::Receiver<LoadJob>>,
    fetcher: &dyn Fetcher,
    done: &mpsc::Sender<Completion>,
) {
    loop {
        let job = match rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(job) = job else { return };
        let result = fetcher.fetch(&Request::get(job.url.as_str()));
        match job.kind {
            LoadKind::Prefetch => {
                let _: BestEffort = best_effort(&job.url, result);
            }
            LoadKind::Target {
                generation,
                slot,
                asset,
            } => {
                let loaded = match result {
                    Ok(resp) if resp.ok() => true,
                    Ok(resp) => {
                        debug!("viewport: {} returned status {}", job.url, resp.status);
                        false
                    }
                    Err(e) => {
                        debug!("viewport: load of {} failed: {e:#}", job.url);
                        false
                    }
                };
                let _ = done.send(Completion {
                    generation,
                    slot,
                    asset,
                    url: job.url,
                    loaded,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// What a slot currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shown {
    asset: AssetId,
    degraded: bool,
}

pub struct ViewportLoader<D: Display> {
    ctx: AppContext,
    display: D,
    current_page: u32,
    generation: Generation,
    dual_active: bool,
    zoom: f64,
    /// High-tier load already issued for the current generation.
    zoom_requested: bool,
    shown: [Option<Shown>; 2],
    /// Target loads of the current generation not yet completed.
    outstanding: usize,
    targets: LoadPool,
    prefetch: LoadPool,
    completions: mpsc::Receiver<Completion>,
}

impl<D: Display> ViewportLoader<D> {
    /// `fetcher` is normally a [`crate::worker::ClientFetcher`] so every
    /// load goes through the gateway. At least two target workers are
    /// started so one slow page cannot stall the next render.
    pub fn new(
        ctx: AppContext,
        fetcher: Arc<dyn Fetcher>,
        display: D,
        workers: usize,
    ) -> Result<Self> {
        let (done, completions) = mpsc::channel();
        let workers = workers.max(2);
        let targets = LoadPool::new("load", workers, Arc::clone(&fetcher), done.clone())?;
        let prefetch = LoadPool::new("prefetch", workers, fetcher, done)?;
        let dual_active = ctx.dual_page == DualPage::On;
        debug!(
            "viewport: {} pages, reading tier {}, {workers} workers per pool",
            ctx.total_pages, ctx.reading_tier
        );
        Ok(Self {
            ctx,
            display,
            current_page: 0,
            generation: Generation::default(),
            dual_active,
            zoom: ZOOM_MIN,
            zoom_requested: false,
            shown: [None, None],
            outstanding: 0,
            targets,
            prefetch,
            completions,
        })
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    /// Host-decided spread mode, honoured only when the setting is `auto`.
    /// Takes effect on the next render.
    pub fn set_dual_active(&mut self, active: bool) {
        self.dual_active = match self.ctx.dual_page {
            DualPage::Auto => active,
            DualPage::On => true,
            DualPage::Off => false,
        };
    }

    /// Display `page` (clamped), starting a new generation.
    pub fn render(&mut self, page: i64) {
        let page = clamp_page(page, self.ctx.total_pages);
        self.generation = self.generation.bump();
        self.current_page = page;
        self.zoom = ZOOM_MIN;
        self.zoom_requested = false;
        self.outstanding = 0;
        debug!("viewport: render page {page} ({:?})", self.generation);

        self.show_page(Slot::Primary, page);
        if self.dual_active && page < self.ctx.total_pages {
            self.show_page(Slot::Secondary, page + 1);
        } else {
            self.shown[Slot::Secondary.index()] = None;
            self.display.hide(Slot::Secondary);
        }
        self.prefetch_neighbours(page);
    }

    /// Render `page` unless it is already current. Returns whether a
    /// render happened.
    pub fn go_to(&mut self, page: i64) -> bool {
        let page = clamp_page(page, self.ctx.total_pages);
        if page == self.current_page {
            return false;
        }
        self.render(i64::from(page));
        true
    }

    pub fn next_page(&mut self) -> bool {
        let next = self.current_page + self.ctx.page_step();
        if next > self.ctx.total_pages {
            return false;
        }
        self.go_to(i64::from(next))
    }

    pub fn prev_page(&mut self) -> bool {
        let step = self.ctx.page_step();
        // No partial step back: page 2 of a spread stays put
        if self.current_page <= step {
            return false;
        }
        self.go_to(i64::from(self.current_page - step))
    }

    /// Apply a pinch/zoom scale. Above the promotion threshold the primary
    /// slot is upgraded to the high tier; at or below the reset threshold
    /// it returns to the reading tier. Returns the clamped scale.
    pub fn promote_zoom(&mut self, scale: f64) -> f64 {
        let scale = scale.clamp(ZOOM_MIN, ZOOM_MAX);
        if scale <= ZOOM_RESET_AT {
            self.reset_zoom();
            return self.zoom;
        }
        self.zoom = scale;
        if scale > ZOOM_PROMOTE_ABOVE
            && !self.zoom_requested
            && self.current_page > 0
            && self.ctx.reading_tier < Tier::High
        {
            self.zoom_requested = true;
            let asset = AssetId::new(self.current_page, Tier::High);
            debug!("viewport: zoom {scale:.2}, promoting page {} to high", asset.page);
            self.load_target(Slot::Primary, asset);
        }
        self.zoom
    }

    pub fn reset_zoom(&mut self) {
        self.zoom = ZOOM_MIN;
        self.zoom_requested = false;
        let Some(shown) = self.shown[Slot::Primary.index()] else {
            return;
        };
        if shown.asset.tier == Tier::High && self.ctx.reading_tier < Tier::High {
            let asset = AssetId::new(shown.asset.page, self.ctx.reading_tier);
            self.set_shown(Slot::Primary, asset, false);
        }
    }

    /// Apply every completion that has already arrived. Returns the number
    /// applied to the display.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(done) = self.completions.try_recv() {
            applied += usize::from(self.apply(done));
        }
        applied
    }

    /// Block until every target load of the current generation has
    /// completed or `timeout` elapses, applying completions as they come.
    /// Returns `true` if nothing is outstanding.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.outstanding > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.completions.recv_timeout(left) {
                Ok(done) => {
                    self.apply(done);
                }
                Err(_) => break,
            }
        }
        self.poll();
        self.outstanding == 0
    }

    fn show_page(&mut self, slot: Slot, page: u32) {
        let reading = self.ctx.reading_tier;
        let placeholder = AssetId::new(page, Tier::Thumb);
        self.set_shown(slot, placeholder, reading != Tier::Thumb);
        if reading != Tier::Thumb {
            self.load_target(slot, AssetId::new(page, reading));
        }
    }

    fn load_target(&mut self, slot: Slot, asset: AssetId) {
        self.outstanding += 1;
        self.targets.submit(LoadJob {
            url: self.ctx.layout.asset_url(asset),
            kind: LoadKind::Target {
                generation: self.generation,
                slot,
                asset,
            },
        });
    }

    fn prefetch_neighbours(&self, page: u32) {
        let total = self.ctx.total_pages;
        for offset in 1..=self.ctx.preload_range {
            let neighbours = [page.checked_add(offset), page.checked_sub(offset)];
            for p in neighbours.into_iter().flatten() {
                if (1..=total).contains(&p) {
                    self.prefetch.submit(LoadJob {
                        url: self.ctx.layout.asset_url(AssetId::new(p, self.ctx.reading_tier)),
                        kind: LoadKind::Prefetch,
                    });
                }
            }
        }
    }

    /// Apply one completion if it belongs to the current generation.
    fn apply(&mut self, done: Completion) -> bool {
        if done.generation != self.generation {
            trace!(
                "viewport: dropping stale {} ({:?}, now {:?})",
                done.url, done.generation, self.generation
            );
            return false;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        if !done.loaded {
            return false;
        }
        if done.asset.tier == Tier::High && self.ctx.reading_tier < Tier::High && !self.zoom_requested {
            trace!("viewport: zoom was reset, ignoring {}", done.url);
            return false;
        }
        let idx = done.slot.index();
        if let Some(shown) = self.shown[idx]
            && (shown.asset.page != done.asset.page
                || (!shown.degraded && shown.asset.tier > done.asset.tier))
        {
            return false;
        }
        self.set_shown(done.slot, done.asset, false);
        true
    }

    fn set_shown(&mut self, slot: Slot, asset: AssetId, degraded: bool) {
        let url = self.ctx.layout.asset_url(asset);
        self.display.set_source(slot, &url, degraded);
        self.shown[slot.index()] = Some(Shown { asset, degraded });
    }
}
