use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use mushaf::asset::{Tier, classify};
use mushaf::config::{self, Config};
use mushaf::context::FALLBACK_TOTAL_PAGES;
use mushaf::control::{DownloadControl, DownloadState};
use mushaf::metadata::{METADATA_PATH, Metadata};
use mushaf::net::{HttpFetcher, Request};
use mushaf::store::{CacheStorage, DiskBackend};
use mushaf::viewport::{Display, Slot, ViewportLoader};
use mushaf::worker::{Client, Registration};

/// How long `show` waits for the reading tier before giving up.
const SHOW_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "mushaf",
    about = "Offline page cache and progressive loader for a mushaf page reader",
    long_version = env!("MUSHAF_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Site base URL (overrides config)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Cache storage directory (overrides config)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log output file path
    #[arg(long, global = true)]
    log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Install the configured cache version and purge older ones
    Install,
    /// Download every page of one tier into the cache
    Sync {
        /// Tier to download (thumb, medium, high)
        #[arg(long)]
        tier: Option<Tier>,

        /// Page count (defaults to the metadata document)
        #[arg(long)]
        total_pages: Option<u32>,
    },
    /// Fetch one URL or site path through the cache gateway
    Get {
        /// Absolute URL or site-relative path
        target: String,

        /// Write the body here instead of printing a summary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List cache versions and their entry counts
    Caches,
    /// Render a page through the viewport loader and report what is displayed
    Show {
        page: i64,

        /// Show the facing page as well
        #[arg(long)]
        dual: bool,

        /// Zoom scale (1.0 to 4.0)
        #[arg(long)]
        zoom: Option<f64>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Some(log_path) = &cli.log {
        let file = match std::fs::File::create(log_path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Error: failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    } else {
        env_logger::init();
    }

    // Load config file and merge CLI overrides
    let mut cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    cfg.merge_cli(cli.base_url, cli.cache_dir);
    let config = cfg.resolve();

    let result = match cli.command {
        Command::Install => cmd_install(&config),
        Command::Sync { tier, total_pages } => cmd_sync(&config, tier, total_pages),
        Command::Get { target, output } => cmd_get(&config, &target, output),
        Command::Caches => cmd_caches(&config),
        Command::Show { page, dual, zoom } => cmd_show(&config, page, dual, zoom),
    };

    if let Err(e) = result {
        let msg = format!("{e:#}");
        if msg.contains("[BUG]") {
            eprintln!("\x1b[1;31m{msg}\x1b[0m");
        } else {
            eprintln!("Error: {msg}");
        }
        std::process::exit(1);
    }
}

fn open_storage(config: &Config) -> Result<CacheStorage> {
    let backend = DiskBackend::new(&config.cache_dir)?;
    Ok(CacheStorage::new(Arc::new(backend)))
}

fn registration(config: &Config) -> Result<Registration> {
    let network = HttpFetcher::new(config.worker.fetch_timeout);
    Ok(Registration::new(open_storage(config)?, Arc::new(network)))
}

/// Page count from config, else from the metadata document.
fn total_pages(config: &Config, client: &Client) -> u32 {
    if let Some(n) = config.total_pages {
        return n;
    }
    let url = config.layout().url(METADATA_PATH);
    Metadata::load(&client.fetcher(), &url).total_pages()
}

/// Resume the installed version, installing it if this is the first run.
fn connect(config: &Config) -> Result<(Registration, Client)> {
    let reg = registration(config)?;
    // Commands posted by this CLI always carry an explicit page count
    let settings = config.worker_settings(FALLBACK_TOTAL_PAGES);
    if !reg.resume(settings.clone())? {
        info!("no installed cache {}, installing", config.worker.cache_name);
        reg.register(settings)?;
    }
    let client = reg.client();
    Ok((reg, client))
}

fn cmd_install(config: &Config) -> Result<()> {
    let start = Instant::now();
    let reg = registration(config)?;
    let before = reg.storage().keys()?;
    reg.register(config.worker_settings(FALLBACK_TOTAL_PAGES))?;
    let after = reg.storage().keys()?;
    for name in before.iter().filter(|n| !after.contains(n)) {
        eprintln!("deleted stale cache {name}");
    }
    let cache = reg.storage().open(&config.worker.cache_name)?;
    eprintln!(
        "installed {} ({} entries) in {:.1}ms",
        cache.name(),
        cache.len()?,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

fn cmd_sync(config: &Config, tier: Option<Tier>, pages: Option<u32>) -> Result<()> {
    let (_reg, client) = connect(config)?;
    let total = match pages.filter(|&n| n > 0) {
        Some(n) => n,
        None => total_pages(config, &client),
    };
    let tier = tier.unwrap_or(config.reader.tier);

    let mut control = DownloadControl::new();
    client.post(control.start(total, tier)?)?;
    eprintln!("{}", control.status_line());
    loop {
        let Some(msg) = client.recv_timeout(Duration::from_secs(1)) else {
            continue;
        };
        if control.handle(msg) {
            eprintln!("{}", control.status_line());
        }
        if let DownloadState::Complete { errors, .. } = control.state() {
            if errors > 0 {
                bail!("{errors} page(s) failed to download");
            }
            return Ok(());
        }
    }
}

fn cmd_get(config: &Config, target: &str, output: Option<PathBuf>) -> Result<()> {
    let (_reg, client) = connect(config)?;
    let url = config.layout().url(target);
    let start = Instant::now();
    let resp = client.fetch(&Request::get(url.as_str()))?;
    info!(
        "get: {url} ({:?}) -> {} in {:.1}ms",
        classify(&url),
        resp.status,
        start.elapsed().as_secs_f64() * 1000.0
    );
    match output {
        Some(path) => {
            std::fs::write(&path, &resp.body)
                .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
            eprintln!("{} {url} -> {} ({} bytes)", resp.status, path.display(), resp.body.len());
        }
        None => {
            let kind = resp.header("content-type").unwrap_or("unknown type");
            println!("{} {url} ({kind}, {} bytes)", resp.status, resp.body.len());
        }
    }
    if !resp.ok() {
        bail!("{url} returned status {}", resp.status);
    }
    Ok(())
}

fn cmd_caches(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    let names = storage.keys()?;
    if names.is_empty() {
        eprintln!("no caches in {}", config.cache_dir.display());
    }
    for name in names {
        let marker = if name == config.worker.cache_name { "*" } else { " " };
        let cache = storage.open(&name)?;
        println!("{marker} {name}\t{} entries", cache.len()?);
    }
    Ok(())
}

/// Prints every slot change.
struct PrintDisplay;

impl Display for PrintDisplay {
    fn set_source(&mut self, slot: Slot, url: &str, degraded: bool) {
        let note = if degraded { " (placeholder)" } else { "" };
        println!("{slot:?}: {url}{note}");
    }

    fn hide(&mut self, slot: Slot) {
        println!("{slot:?}: hidden");
    }
}

fn cmd_show(config: &Config, page: i64, dual: bool, zoom: Option<f64>) -> Result<()> {
    let (_reg, client) = connect(config)?;
    let meta = Metadata::load(&client.fetcher(), &config.layout().url(METADATA_PATH));
    let total = config.total_pages.unwrap_or(meta.total_pages());
    let ctx = config.app_context(total);

    let mut loader = ViewportLoader::new(
        ctx,
        Arc::new(client.fetcher()),
        PrintDisplay,
        config.reader.loader_workers,
    )?;
    loader.set_dual_active(dual);
    loader.render(page);
    if !loader.wait(SHOW_TIMEOUT) {
        warn!("show: page {} still loading after {SHOW_TIMEOUT:?}", loader.current_page());
    }
    if let Some(scale) = zoom {
        loader.promote_zoom(scale);
        loader.wait(SHOW_TIMEOUT);
    }
    match meta.juz_for_page(loader.current_page()) {
        Some(juz) => eprintln!("page {}/{total}, juz {}", loader.current_page(), juz.number),
        None => eprintln!("page {}/{total}", loader.current_page()),
    }
    Ok(())
}
