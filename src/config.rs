use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::asset::{DEFAULT_IMAGE_EXT, SiteLayout, Tier};
use crate::context::{AppContext, DEFAULT_PRELOAD_RANGE, DualPage};
use crate::sync::DEFAULT_BATCH_SIZE;
use crate::viewport::DEFAULT_LOADER_WORKERS;
use crate::worker::{DEFAULT_SHELL_FILES, WorkerSettings};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";
const DEFAULT_CACHE_NAME: &str = "quran-v1";

// ---------------------------------------------------------------------------
// ConfigFile — deserialized from TOML (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub base_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
    /// Overrides the page count from the metadata document.
    pub total_pages: Option<u32>,
    pub image_ext: Option<String>,
    #[serde(default)]
    pub reader: ReaderConfigFile,
    #[serde(default)]
    pub worker: WorkerConfigFile,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ReaderConfigFile {
    pub tier: Option<Tier>,
    pub dual_page: Option<DualPage>,
    pub preload_range: Option<u32>,
    pub loader_workers: Option<usize>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfigFile {
    pub cache_name: Option<String>,
    pub batch_size: Option<usize>,
    pub shell_files: Option<Vec<String>>,
    pub fetch_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config — resolved (all fields concrete)
// ---------------------------------------------------------------------------

pub struct Config {
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub total_pages: Option<u32>,
    pub image_ext: String,
    pub reader: ReaderConfig,
    pub worker: WorkerConfig,
}

pub struct ReaderConfig {
    pub tier: Tier,
    pub dual_page: DualPage,
    pub preload_range: u32,
    pub loader_workers: usize,
}

pub struct WorkerConfig {
    pub cache_name: String,
    pub batch_size: usize,
    pub shell_files: Vec<String>,
    /// `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
}

impl ConfigFile {
    /// Merge CLI values (overwrites non-None fields).
    pub fn merge_cli(&mut self, base_url: Option<String>, cache_dir: Option<PathBuf>) {
        if let Some(ref v) = base_url {
            debug!("config: CLI override base_url={v}");
            self.base_url = base_url;
        }
        if let Some(ref v) = cache_dir {
            debug!("config: CLI override cache_dir={}", v.display());
            self.cache_dir = cache_dir;
        }
    }

    /// Resolve to a Config by applying defaults to missing fields.
    pub fn resolve(self) -> Config {
        let config = Config {
            base_url: self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            cache_dir: self.cache_dir.unwrap_or_else(default_cache_dir),
            total_pages: self.total_pages.filter(|&n| n > 0),
            image_ext: self.image_ext.unwrap_or_else(|| DEFAULT_IMAGE_EXT.into()),
            reader: ReaderConfig {
                tier: self.reader.tier.unwrap_or(Tier::Medium),
                dual_page: self.reader.dual_page.unwrap_or_default(),
                preload_range: self.reader.preload_range.unwrap_or(DEFAULT_PRELOAD_RANGE),
                loader_workers: self.reader.loader_workers.unwrap_or(DEFAULT_LOADER_WORKERS),
            },
            worker: WorkerConfig {
                cache_name: self
                    .worker
                    .cache_name
                    .unwrap_or_else(|| DEFAULT_CACHE_NAME.into()),
                batch_size: self.worker.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
                shell_files: self.worker.shell_files.unwrap_or_else(|| {
                    DEFAULT_SHELL_FILES.iter().map(|s| s.to_string()).collect()
                }),
                fetch_timeout: self.worker.fetch_timeout_ms.map(Duration::from_millis),
            },
        };
        info!(
            "config: resolved base_url={}, cache_dir={}, total_pages={:?}, image_ext={}, \
             tier={}, dual_page={:?}, preload_range={}, loader_workers={}, \
             cache_name={}, batch_size={}, shell_files={}, fetch_timeout={:?}",
            config.base_url,
            config.cache_dir.display(),
            config.total_pages,
            config.image_ext,
            config.reader.tier,
            config.reader.dual_page,
            config.reader.preload_range,
            config.reader.loader_workers,
            config.worker.cache_name,
            config.worker.batch_size,
            config.worker.shell_files.len(),
            config.worker.fetch_timeout,
        );
        config
    }
}

impl Config {
    pub fn layout(&self) -> SiteLayout {
        SiteLayout::new(&self.base_url, &self.image_ext)
    }

    /// Settings for one worker version. `total_pages` is the bulk sync
    /// default when a command omits it.
    pub fn worker_settings(&self, total_pages: u32) -> WorkerSettings {
        WorkerSettings {
            cache_name: self.worker.cache_name.clone(),
            shell_files: self.worker.shell_files.clone(),
            layout: self.layout(),
            batch_size: self.worker.batch_size,
            default_total_pages: total_pages,
            default_tier: self.reader.tier,
        }
    }

    pub fn app_context(&self, total_pages: u32) -> AppContext {
        AppContext {
            layout: self.layout(),
            total_pages,
            reading_tier: self.reader.tier,
            dual_page: self.reader.dual_page,
            preload_range: self.reader.preload_range,
        }
    }
}

/// `$XDG_CACHE_HOME/mushaf`, `~/.cache/mushaf`, or a temp dir fallback.
fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("mushaf")
}

/// Resolve the XDG config path for mushaf.
fn config_path() -> Option<PathBuf> {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(config_dir.join("mushaf").join("config.toml"))
}

/// Load config file. Returns `ConfigFile::default()` if no file exists.
/// Returns an error if the file exists but cannot be parsed.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    let path = match config_path() {
        Some(p) => p,
        None => {
            info!("config: no HOME or XDG_CONFIG_HOME set, using defaults");
            return Ok(ConfigFile::default());
        }
    };
    debug!("config: looking for {}", path.display());
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            info!("config: loaded from {}", path.display());
            let cfg: ConfigFile = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("config: {} not found, using defaults", path.display());
            Ok(ConfigFile::default())
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.base_url, DEFAULT_BASE_URL);
        assert_eq!(resolved.total_pages, None);
        assert_eq!(resolved.image_ext, "webp");
        assert_eq!(resolved.reader.tier, Tier::Medium);
        assert_eq!(resolved.reader.dual_page, DualPage::Auto);
        assert_eq!(resolved.reader.preload_range, 5);
        assert_eq!(resolved.worker.cache_name, "quran-v1");
        assert_eq!(resolved.worker.batch_size, 10);
        assert_eq!(resolved.worker.shell_files.len(), 8);
        assert_eq!(resolved.worker.fetch_timeout, None);
    }

    #[test]
    fn partial_toml() {
        let text = r#"
            total_pages = 604
            [reader]
            tier = "high"
            dual_page = "on"
            [worker]
            cache_name = "quran-v2"
            fetch_timeout_ms = 1500
        "#;
        let cfg: ConfigFile = toml::from_str(text).unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.total_pages, Some(604));
        assert_eq!(resolved.reader.tier, Tier::High);
        assert_eq!(resolved.reader.dual_page, DualPage::On);
        assert_eq!(resolved.worker.cache_name, "quran-v2");
        assert_eq!(resolved.worker.fetch_timeout, Some(Duration::from_millis(1500)));
        // Defaults for unspecified fields
        assert_eq!(resolved.reader.preload_range, 5);
        assert_eq!(resolved.worker.batch_size, 10);
    }

    #[test]
    fn invalid_toml() {
        assert!(toml::from_str::<ConfigFile>("this is not valid toml [[[").is_err());
        assert!(toml::from_str::<ConfigFile>("[reader]\ntier = \"ultra\"").is_err());
    }

    #[test]
    fn zero_values_fall_back() {
        let cfg: ConfigFile = toml::from_str("total_pages = 0\n[worker]\nbatch_size = 0").unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.total_pages, None);
        assert_eq!(resolved.worker.batch_size, 1);
    }

    #[test]
    fn cli_overrides() {
        let mut cfg: ConfigFile = toml::from_str("base_url = \"https://a.invalid/\"").unwrap();
        cfg.merge_cli(Some("https://b.invalid/q".into()), Some(PathBuf::from("/tmp/m")));
        let resolved = cfg.resolve();
        assert_eq!(resolved.base_url, "https://b.invalid/q"); // CLI wins
        assert_eq!(resolved.cache_dir, PathBuf::from("/tmp/m"));
        assert_eq!(
            resolved.layout().url("./index.html"),
            "https://b.invalid/q/index.html"
        );
    }

    #[test]
    fn derived_settings() {
        let resolved = ConfigFile::default().resolve();
        let settings = resolved.worker_settings(847);
        assert_eq!(settings.default_total_pages, 847);
        assert_eq!(settings.default_tier, Tier::Medium);
        let ctx = resolved.app_context(847);
        assert_eq!(ctx.total_pages, 847);
        assert_eq!(ctx.page_step(), 1);
    }
}
