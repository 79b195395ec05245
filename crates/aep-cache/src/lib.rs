//! # aep-cache
//!
//! The cache engine: decides per read whether a virtual file is served
//! from the host-local cache or straight from the storage backend, admits
//! files into the cache under the global size bound, and evicts
//! unreferenced files to regain space.
//!
//! A cache file mirrors its virtual path under the cache root. Its
//! on-disk size is the whole story: equal to the manifest size means
//! fully materialized, anything else (usually 0) is a placeholder. A
//! failed download simply leaves a placeholder behind, so the next read
//! retries cleanly. All transitions of a cache file happen under that
//! path's cross-process lock.

mod backend;
mod stats;

pub use backend::{
    Backend, BackendError, ObjectStore, PosixMount, DEFAULT_OBJECT_STORE_ENDPOINT,
};
pub use stats::{IoStats, OpStat};

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use aep_state::{PathLock, SharedState, StateError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

pub struct CacheEngine {
    cache_root: PathBuf,
    max_file_size: u64,
    max_cache_size: u64,
    backend: Backend,
    state: Arc<SharedState>,
    pub stats: IoStats,
}

impl CacheEngine {
    pub fn new(
        cache_root: PathBuf,
        max_file_size: u64,
        max_cache_size: u64,
        backend: Backend,
        state: Arc<SharedState>,
    ) -> CacheEngine {
        CacheEngine {
            cache_root,
            max_file_size: max_file_size.min(max_cache_size),
            max_cache_size,
            backend,
            state,

            stats: IoStats::default(),
        }
    }

    /// Location of the cache file mirroring a virtual path.
    pub fn cache_path(&self, vpath: &str) -> PathBuf {
        self.cache_root.join(vpath.trim_start_matches('/'))
    }

    /// Create the cache placeholder (with parent directories) if missing
    /// and open it read-only. The returned descriptor backs the shim's
    /// synthetic handle for this virtual path.
    pub fn open_placeholder(&self, vpath: &str, is_dir: bool) -> io::Result<File> {
        let path = self.cache_path(vpath);
        if fs::symlink_metadata(&path).is_err() {
            if is_dir {
                fs::create_dir_all(&path)?;
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new().write(true).create(true).open(&path)?;
            }
        }
        File::open(&path)
    }

    /// Read `buf.len()` bytes of `vpath` at `offset`.
    ///
    /// Under the path's cross-process lock the engine downloads the file
    /// into the cache when it fits (evicting unreferenced files first if
    /// the bound requires it); the read itself is then served from the
    /// cache file, or from the backend when the file was not admitted.
    /// Short reads at end of file are honored; the caller advances its
    /// descriptor offset by the returned count.
    pub fn read(
        &self,
        vpath: &str,
        manifest_size: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let cache_path = self.cache_path(vpath);
        let mut cached = false;

        {
            let _lock = PathLock::acquire(vpath)?;
            // The placeholder must exist (the descriptor table creates it);
            // a vanished cache file sends this read to the backend.
            if let Ok(meta) = fs::metadata(&cache_path) {
                if meta.len() == manifest_size {
                    cached = true;
                } else if manifest_size <= self.max_file_size {
                    if manifest_size as i64 + self.state.cache_size() > self.max_cache_size as i64 {
                        self.reduce(manifest_size);
                    }
                    if manifest_size as i64 + self.state.cache_size() <= self.max_cache_size as i64
                    {
                        cached = self.download(vpath, &cache_path, manifest_size);
                    } else {
                        debug!(vpath, manifest_size, "no room to cache");
                    }
                }
            }
        }

        let start = Instant::now();
        if cached {
            let file = File::open(&cache_path)?;
            let n = file.read_at(buf, offset)?;
            self.stats.cached.record(n as u64, micros_since(start));
            Ok(n)
        } else {
            let n = self.backend.read_remote(vpath, offset, buf)?;
            self.stats.remote.record(n as u64, micros_since(start));
            Ok(n)
        }
    }

    /// Download under the caller-held path lock; true when the cache file
    /// is fully materialized and accounted for.
    fn download(&self, vpath: &str, cache_path: &Path, manifest_size: u64) -> bool {
        let start = Instant::now();
        if let Err(e) = self
            .backend
            .download_file(vpath, cache_path, manifest_size)
        {
            warn!(vpath, error = %e, "download failed");
            return false;
        }
        // The manifest is authoritative; a store that disagrees leaves a
        // placeholder behind and the read falls back to the backend.
        let on_disk = fs::metadata(cache_path).map(|m| m.len()).unwrap_or(0);
        if on_disk != manifest_size {
            warn!(vpath, on_disk, manifest_size, "download size mismatch");
            return false;
        }
        self.state.add_cache_size(manifest_size as i64);
        self.stats
            .download
            .record(manifest_size, micros_since(start));
        debug!(vpath, manifest_size, "download done");
        true
    }

    /// Eviction pass: truncate unreferenced cache files in enumeration
    /// order until `required` more bytes fit under the bound or the walk
    /// runs out of candidates. Files that are open, locked by another
    /// process, or failing IO are skipped; eviction never fails a read.
    fn reduce(&self, required: u64) {
        for entry in WalkDir::new(&self.cache_root).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if size == 0 {
                continue;
            }
            let Some(vpath) = self.vpath_of(entry.path()) else {
                continue;
            };
            if self.state.ref_count(&vpath) != 0 {
                continue;
            }
            let guard = match PathLock::try_acquire(&vpath) {
                Ok(Some(guard)) => guard,
                Ok(None) | Err(_) => continue,
            };
            match truncate_to_zero(entry.path()) {
                Ok(()) => {
                    self.state.add_cache_size(-(size as i64));
                    debug!(vpath = %vpath, size, "evicted");
                }
                Err(e) => {
                    warn!(vpath = %vpath, error = %e, "evict failed");
                    continue;
                }
            }
            drop(guard);
            if self.state.cache_size() + required as i64 <= self.max_cache_size as i64 {
                return;
            }
        }
    }

    fn vpath_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.cache_root).ok()?;
        Some(format!("/{}", rel.to_string_lossy()))
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }
}

fn truncate_to_zero(path: &Path) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(0)
}

fn micros_since(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}
