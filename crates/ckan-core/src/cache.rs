//! Content-addressed download cache keyed by source URL.
//!
//! Files are stored flat as `<HASH>-<description>`, where `HASH` is the first
//! eight hex characters of SHA-256 over the URL. The directory listing is the
//! only index. It is memoized and rebuilt lazily whenever the generation
//! counter moves past the one the memo was built at.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const HASH_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct Index {
    generation: u64,
    by_hash: HashMap<String, PathBuf>,
}

#[derive(Debug)]
pub struct NetFileCache {
    dir: PathBuf,
    generation: AtomicU64,
    index: Mutex<Option<Index>>,
}

impl NetFileCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if dir.exists() && !dir.is_dir() {
            return Err(CacheError::NotADirectory(dir));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            generation: AtomicU64::new(0),
            index: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hash prefix for `url`.
    pub fn url_hash(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut hex = hex::encode_upper(digest);
        hex.truncate(HASH_LEN);
        hex
    }

    /// Forces the next lookup to re-list the directory.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup(&self, hash: &str) -> Option<PathBuf> {
        let current = self.generation.load(Ordering::SeqCst);
        let mut guard = match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = guard.as_ref().is_none_or(|idx| idx.generation != current);
        if stale {
            *guard = Some(Index {
                generation: current,
                by_hash: self.list(),
            });
        }
        guard.as_ref().and_then(|idx| idx.by_hash.get(hash).cloned())
    }

    fn list(&self) -> HashMap<String, PathBuf> {
        let mut out = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((hash, _)) = name.split_once('-') {
                if hash.len() == HASH_LEN {
                    out.insert(hash.to_string(), path.clone());
                }
            }
        }
        debug!(entries = out.len(), dir = %self.dir.display(), "Indexed download cache");
        out
    }

    /// Path of the cached file for `url`, if any.
    pub fn get_cached_filename(&self, url: &str) -> Option<PathBuf> {
        let hash = Self::url_hash(url);
        let path = self.lookup(&hash)?;
        if path.exists() {
            return Some(path);
        }
        // Removed behind our back; re-list once.
        self.invalidate();
        self.lookup(&hash).filter(|p| p.exists())
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.get_cached_filename(url).is_some()
    }

    /// Path of the cached archive for `url` if it opens as a valid zip.
    ///
    /// With `verify_contents`, every entry is also read through so CRCs are
    /// checked. Any failure reads as "not cached".
    pub fn get_cached_zip(&self, url: &str, verify_contents: bool) -> Option<PathBuf> {
        let path = self.get_cached_filename(url)?;
        match verify_zip(&path, verify_contents) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(url, error = %e, "Cached archive failed validation");
                None
            }
        }
    }

    pub fn is_cached_zip(&self, url: &str) -> bool {
        self.get_cached_zip(url, false).is_some()
    }

    /// Stores `source` as the cache entry for `url`, replacing any previous entry.
    ///
    /// The file is named after `description` if given, else after the source
    /// file name, with characters outside `[A-Za-z0-9_.-]` replaced.
    pub fn store(
        &self,
        url: &str,
        source: &Path,
        description: Option<&str>,
        move_file: bool,
    ) -> Result<PathBuf, CacheError> {
        self.remove(url)?;

        let name = description
            .map(str::to_string)
            .or_else(|| {
                source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let target = self
            .dir
            .join(format!("{}-{}", Self::url_hash(url), sanitize(&name)));

        if move_file {
            if fs::rename(source, &target).is_err() {
                fs::copy(source, &target)?;
                fs::remove_file(source)?;
            }
        } else {
            fs::copy(source, &target)?;
        }

        self.invalidate();
        debug!(url, path = %target.display(), "Stored in cache");
        Ok(target)
    }

    /// Deletes the entry for `url`. Returns whether a file was removed.
    pub fn remove(&self, url: &str) -> Result<bool, CacheError> {
        let Some(path) = self.get_cached_filename(url) else {
            return Ok(false);
        };
        fs::remove_file(&path)?;
        self.invalidate();
        Ok(true)
    }

    /// Deletes everything in the cache directory.
    pub fn cleanup(&self) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.invalidate();
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Opens `path` as a zip archive, optionally reading every entry to check CRCs.
pub fn verify_zip(path: &Path, verify_contents: bool) -> Result<(), CacheError> {
    let corrupt = |reason: String| CacheError::CorruptArchive {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    if verify_contents {
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;
            io::copy(&mut entry, &mut io::sink())
                .map_err(|e| corrupt(format!("{}: {e}", entry.name())))?;
        }
    }
    Ok(())
}
