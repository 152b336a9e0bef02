//! Keyed, file-backed cache for remote byte streams.
//!
//! The first reader of a key streams from the supplier while the bytes are
//! teed into a temporary file; at end of stream the temporary file is
//! renamed into place. Later readers get the cached file directly.
//!
//! Each key has a fair lock held from the cache-miss check until the
//! populating reader reaches end of stream or is dropped, so concurrent
//! readers of one key never see a partial file and the supplier runs at
//! most once per successful population. Different keys never contend.
//!
//! ```text
//! <cache_dir>/
//!   <key or sha256(key)>          # complete entries
//!   .<name>-XXXXXX                # in-flight population (deleted on abandon)
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{FairMutex, Mutex, RawFairMutex};
use tempfile::NamedTempFile;

use crate::error::{NimError, Result};
use crate::streams::sha256_hex;

type KeyGuard = ArcMutexGuard<RawFairMutex, ()>;

const MAX_VERBATIM_KEY_LEN: usize = 128;

/// File-backed stream cache with per-key fair locking.
pub struct StreamCache {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<FairMutex<()>>>>,
}

impl StreamCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            NimError::storage(
                format!("Failed to create cache directory {}", dir.display()),
                e,
            )
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stream the bytes for `key`, calling `supplier` on a cache miss.
    ///
    /// On a miss the returned reader populates the cache as it is read. If
    /// it is dropped before end of stream, or `supplier` fails, nothing is
    /// cached and the key lock is released.
    pub fn get<F>(&self, key: &str, supplier: F) -> Result<Box<dyn Read + Send>>
    where
        F: FnOnce() -> Result<Box<dyn Read + Send>>,
    {
        let guard = self.key_lock(key).lock_arc();
        let path = self.path_for(key);

        if path.is_file() {
            drop(guard);
            tracing::debug!(key, path = %path.display(), "Stream cache hit");
            let file = File::open(&path).map_err(|e| {
                NimError::storage(format!("Error opening cached {}", path.display()), e)
            })?;
            return Ok(Box::new(BufReader::new(file)));
        }

        tracing::debug!(key, "Stream cache miss");
        let inner = supplier()?;
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}-", file_name_for(key)))
            .tempfile_in(&self.dir)
            .map_err(|e| {
                NimError::storage(
                    format!("Error creating cache temp file in {}", self.dir.display()),
                    e,
                )
            })?;

        Ok(Box::new(CachingReader {
            key: key.to_string(),
            inner,
            temp: Some(BufWriter::new(temp)),
            dest: path,
            guard: Some(guard),
        }))
    }

    /// Whether a complete entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Remove a cached entry. Returns `true` if one existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.key_lock(key).lock_arc();
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(NimError::storage(
                format!("Error removing cached {}", path.display()),
                e,
            )),
        }
    }

    /// Drop lock entries no reader currently holds. Returns how many were dropped.
    pub fn prune_locks(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    fn key_lock(&self, key: &str) -> Arc<FairMutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(FairMutex::new(())))
            .clone()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

/// Keys made only of file-safe characters are used verbatim, others hashed.
fn file_name_for(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= MAX_VERBATIM_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        key.to_string()
    } else {
        sha256_hex(key.as_bytes())
    }
}

/// Tees a supplier stream into a temp file, promoting it at end of stream.
struct CachingReader {
    key: String,
    inner: Box<dyn Read + Send>,
    temp: Option<BufWriter<NamedTempFile>>,
    dest: PathBuf,
    guard: Option<KeyGuard>,
}

impl CachingReader {
    fn promote(&mut self) {
        if let Some(writer) = self.temp.take() {
            match writer.into_inner() {
                Ok(temp) => match temp.persist(&self.dest) {
                    Ok(_) => {
                        tracing::debug!(key = %self.key, path = %self.dest.display(), "Cached stream");
                    }
                    Err(e) => {
                        tracing::warn!(key = %self.key, error = %e, "Failed to promote cache entry");
                    }
                },
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Failed to flush cache entry");
                }
            }
        }
        self.guard = None;
    }

    fn abandon(&mut self) {
        if self.temp.take().is_some() {
            tracing::debug!(key = %self.key, "Abandoned partial cache entry");
        }
        self.guard = None;
    }
}

impl Read for CachingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.promote();
            return Ok(0);
        }
        if let Some(writer) = self.temp.as_mut() {
            if let Err(e) = writer.write_all(&buf[..n]) {
                tracing::warn!(key = %self.key, error = %e, "Cache write failed; serving uncached");
                self.abandon();
            }
        }
        Ok(n)
    }
}

impl Drop for CachingReader {
    fn drop(&mut self) {
        self.abandon();
    }
}
