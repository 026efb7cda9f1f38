//! Background worker: owns the gateway and runs bulk syncs.
//!
//! Threads:
//!   worker-<version> : event loop, dispatches [`WorkerEvent`]s by kind
//!   fetch            : one short-lived thread per intercepted request
//!   sync-<version>   : one thread per download-all session
//!
//! Foreground clients reach the worker only through the event channel
//! stored in the shared controller slot. Registering a new version installs
//! it, purges older caches, then swaps the slot so every existing client is
//! routed to the new worker immediately (claim). The previous worker thread
//! exits once its last event sender is gone.

mod client;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::{Context, Result};
use log::{debug, error, info};

use crate::asset::{SiteLayout, Tier};
use crate::gateway::Gateway;
use crate::net::{Fetcher, Request, Response};
use crate::protocol::{Command, WorkerMessage};
use crate::store::CacheStorage;
use crate::sync::BulkSync;

pub use client::{Client, ClientFetcher};

/// Manifest cached verbatim at install time.
pub const DEFAULT_SHELL_FILES: &[&str] = &[
    "./",
    "./index.html",
    "./css/styles.css",
    "./js/app.js",
    "./data/metadata.json",
    "./manifest.json",
    "./icons/icon-192.png",
    "./icons/icon-512.png",
];

/// Everything a worker version needs, injected at registration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Cache version; bump to force full invalidation.
    pub cache_name: String,
    /// Site-relative shell paths.
    pub shell_files: Vec<String>,
    pub layout: SiteLayout,
    pub batch_size: usize,
    /// Used when a download command omits `totalPages` or sends 0.
    pub default_total_pages: u32,
    /// Used when a download command omits `tier`.
    pub default_tier: Tier,
}

/// Events handled by the worker loop.
enum WorkerEvent {
    Fetch {
        request: Request,
        reply: mpsc::Sender<Result<Response>>,
    },
    Message {
        command: Command,
        source: mpsc::Sender<WorkerMessage>,
    },
}

/// The worker currently controlling clients.
struct ActiveWorker {
    version: String,
    events: mpsc::Sender<WorkerEvent>,
}

type ControllerSlot = Arc<RwLock<Option<ActiveWorker>>>;

/// Registration point shared by the foreground: registers worker versions
/// and hands out clients.
pub struct Registration {
    storage: CacheStorage,
    network: Arc<dyn Fetcher>,
    controller: ControllerSlot,
    next_client: AtomicU64,
}

impl Registration {
    pub fn new(storage: CacheStorage, network: Arc<dyn Fetcher>) -> Self {
        Self {
            storage,
            network,
            controller: Arc::new(RwLock::new(None)),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Install, activate and start a worker version, then claim all clients.
    ///
    /// If install fails the previous controller (if any) stays in charge and
    /// no cache is purged.
    pub fn register(&self, settings: WorkerSettings) -> Result<()> {
        let shell_urls: Vec<String> = settings
            .shell_files
            .iter()
            .map(|p| settings.layout.url(p))
            .collect();
        let gateway = Gateway::install(
            self.storage.clone(),
            Arc::clone(&self.network),
            &settings.cache_name,
            &shell_urls,
        )?;
        gateway.activate()?;
        self.start(gateway, settings)
    }

    /// Take control with a version installed by an earlier run, without
    /// touching the network. Returns `false` if it was never installed.
    pub fn resume(&self, settings: WorkerSettings) -> Result<bool> {
        let Some(gateway) = Gateway::resume(
            self.storage.clone(),
            Arc::clone(&self.network),
            &settings.cache_name,
        )?
        else {
            return Ok(false);
        };
        gateway.activate()?;
        self.start(gateway, settings)?;
        Ok(true)
    }

    /// Spawn the event loop for `gateway` and swap it into the controller
    /// slot.
    fn start(&self, gateway: Gateway, settings: WorkerSettings) -> Result<()> {
        let version = settings.cache_name.clone();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("worker-{version}"))
            .spawn(move || run(gateway, settings, rx))
            .context("failed to spawn worker thread")?;

        let previous = self
            .controller
            .write()
            .map_err(|_| anyhow::anyhow!("[BUG] controller lock poisoned"))?
            .replace(ActiveWorker {
                version: version.clone(),
                events: tx,
            });
        match previous {
            Some(old) => info!("worker: {version} claimed clients from {}", old.version),
            None => info!("worker: {version} claimed clients"),
        }
        Ok(())
    }

    /// Cache version of the controlling worker.
    pub fn active_version(&self) -> Option<String> {
        controller_version(&self.controller)
    }

    /// A new foreground client. It is controlled by whichever worker is
    /// active at the time of each request.
    pub fn client(&self) -> Client {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        debug!("worker: client {id} connected");
        Client::new(id, Arc::clone(&self.controller), Arc::clone(&self.network))
    }
}

fn controller_version(slot: &ControllerSlot) -> Option<String> {
    slot.read().ok()?.as_ref().map(|w| w.version.clone())
}

fn controller_events(slot: &ControllerSlot) -> Option<mpsc::Sender<WorkerEvent>> {
    slot.read().ok()?.as_ref().map(|w| w.events.clone())
}

/// Worker event loop. Returns when every event sender has been dropped.
fn run(gateway: Gateway, settings: WorkerSettings, events: mpsc::Receiver<WorkerEvent>) {
    let gateway = Arc::new(gateway);
    let settings = Arc::new(settings);
    debug!("worker: {} started", settings.cache_name);
    while let Ok(event) = events.recv() {
        dispatch(&gateway, &settings, event);
    }
    debug!("worker: {} event channel closed, exiting", settings.cache_name);
}

fn dispatch(gateway: &Arc<Gateway>, settings: &Arc<WorkerSettings>, event: WorkerEvent) {
    match event {
        WorkerEvent::Fetch { request, reply } => {
            let gateway = Arc::clone(gateway);
            let spawned = thread::Builder::new()
                .name("fetch".into())
                .spawn(move || {
                    let _ = reply.send(gateway.handle_fetch(&request));
                });
            if let Err(e) = spawned {
                error!("worker: failed to spawn fetch thread: {e}");
            }
        }
        WorkerEvent::Message { command, source } => match command {
            Command::DownloadAll { total_pages, tier } => {
                let total = total_pages
                    .filter(|&n| n > 0)
                    .unwrap_or(settings.default_total_pages);
                let tier = tier.unwrap_or(settings.default_tier);
                let gateway = Arc::clone(gateway);
                let settings = Arc::clone(settings);
                let spawned = thread::Builder::new()
                    .name(format!("sync-{}", settings.cache_name))
                    .spawn(move || {
                        let sync = BulkSync {
                            cache: gateway.cache(),
                            fetcher: gateway.fetcher().as_ref(),
                            layout: &settings.layout,
                            batch_size: settings.batch_size,
                        };
                        sync.download_all(total, tier, &source);
                    });
                if let Err(e) = spawned {
                    error!("worker: failed to spawn sync thread: {e}");
                }
            }
        },
    }
}
