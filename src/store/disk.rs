//! On-disk backend: one directory per cache, one file per entry.
//!
//! Layout:
//!   <root>/<cache-name>/<base64url(xxh3-128(method + " " + url))>
//!
//! File names are fixed-length digests, so URLs of any length can be stored.
//! Each entry file is a bincode-encoded [`StoredEntry`] carrying the full
//! key; a lookup whose key does not match is a miss. Writes go to a
//! temporary file in the same directory and are renamed into place, so a
//! reader sees either the old entry, the new entry, or no entry. Deleting a
//! cache renames its directory to a hidden trash name before removing it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use log::{debug, trace, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use super::{CacheBackend, CacheKey};
use crate::net::Response;

const TMP_PREFIX: &str = ".tmp-";
const TRASH_PREFIX: &str = ".deleting-";

static CACHE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    response: Response,
}

pub struct DiskBackend {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskBackend {
    /// Create a backend rooted at `root` (created if missing).
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root {}", root.display()))?;
        debug!("disk: cache root {}", root.display());
        // Leftovers of deletes interrupted by a crash
        for entry in fs::read_dir(&root)
            .with_context(|| format!("failed to list {}", root.display()))?
            .flatten()
        {
            if entry.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
                remove_trash(&entry.path());
            }
        }
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn cache_dir(&self, cache: &str) -> Result<PathBuf> {
        if !CACHE_NAME_RE.is_match(cache) {
            bail!("invalid cache name '{cache}'");
        }
        Ok(self.root.join(cache))
    }

    fn entry_path(&self, cache: &str, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.cache_dir(cache)?.join(entry_file_name(key)))
    }
}

/// Remove a renamed-away cache directory. A writer that opened its temp file
/// before the rename can still drop one file in, so retry once.
fn remove_trash(path: &Path) {
    let mut result = fs::remove_dir_all(path);
    if let Err(e) = &result
        && e.kind() == io::ErrorKind::DirectoryNotEmpty
    {
        debug!("disk: {} changed during delete, retrying", path.display());
        result = fs::remove_dir_all(path);
    }
    if let Err(e) = result {
        warn!("disk: could not remove {}: {e}", path.display());
    }
}

fn entry_file_name(key: &CacheKey) -> String {
    let digest = xxh3_128(format!("{} {}", key.method, key.url).as_bytes());
    URL_SAFE_NO_PAD.encode(digest.to_be_bytes())
}

impl CacheBackend for DiskBackend {
    fn cache_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && CACHE_NAME_RE.is_match(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create(&self, cache: &str) -> Result<()> {
        let dir = self.cache_dir(cache)?;
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))
    }

    fn delete(&self, cache: &str) -> Result<bool> {
        let dir = self.cache_dir(cache)?;
        // Renaming first makes the cache vanish atomically for other writers
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let trash = self.root.join(format!("{TRASH_PREFIX}{}-{n}", std::process::id()));
        match fs::rename(&dir, &trash) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => bail!("failed to delete {}: {e}", dir.display()),
        }
        remove_trash(&trash);
        Ok(true)
    }

    fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<Response>> {
        let path = self.entry_path(cache, key)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("disk: miss {cache} {}", key.url);
                return Ok(None);
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
        };
        match bincode::serde::decode_from_slice::<StoredEntry, _>(&bytes, bincode::config::standard())
        {
            Ok((entry, _)) if entry.key == *key => {
                trace!("disk: hit {cache} {} ({} bytes)", key.url, entry.response.body.len());
                Ok(Some(entry.response))
            }
            Ok(_) => {
                warn!("disk: key mismatch in {}, treating as miss", path.display());
                Ok(None)
            }
            Err(e) => {
                warn!("disk: corrupt entry {}: {e}, treating as miss", path.display());
                Ok(None)
            }
        }
    }

    fn put(&self, cache: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let dir = self.cache_dir(cache)?;
        if !dir.is_dir() {
            bail!("cache '{cache}' does not exist");
        }
        let path = self.entry_path(cache, key)?;
        let entry = StoredEntry {
            key: key.clone(),
            response: response.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .context("failed to encode cache entry")?;

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{TMP_PREFIX}{}-{n}", std::process::id()));
        if let Err(e) = fs::write(&tmp, &bytes) {
            let _ = fs::remove_file(&tmp);
            bail!("failed to write {}: {e}", tmp.display());
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            bail!("failed to commit {}: {e}", path.display());
        }
        trace!("disk: put {cache} {} ({} bytes)", key.url, bytes.len());
        Ok(())
    }

    fn entry_count(&self, cache: &str) -> Result<usize> {
        let dir = self.cache_dir(cache)?;
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(anyhow::anyhow!("failed to list {}: {e}", dir.display())),
        };
        let mut count = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                count += 1;
            }
        }
        Ok(count)
    }
}
