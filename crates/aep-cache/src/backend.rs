//! Storage backend drivers.
//!
//! A driver knows two operations against a virtual path: copy the whole
//! object into a local file, and fetch a byte range directly. Which driver
//! a process uses is decided once at init from the environment, so the
//! selection is a plain sum type. Drivers never touch the shared state or
//! the per-file locks; serialization is the cache engine's job.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("short copy: {copied} of {expected} bytes")]
    ShortCopy { copied: u64, expected: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store returned status {0}")]
    Status(reqwest::StatusCode),
}

pub type Result<T> = std::result::Result<T, BackendError>;

pub enum Backend {
    Posix(PosixMount),
    ObjectStore(ObjectStore),
}

impl Backend {
    /// Produce a complete local copy of `vpath` at `dest`. On success the
    /// destination holds exactly `expected` bytes.
    pub fn download_file(&self, vpath: &str, dest: &Path, expected: u64) -> Result<()> {
        match self {
            Backend::Posix(driver) => driver.download_file(vpath, dest, expected),
            Backend::ObjectStore(driver) => driver.download_file(vpath, dest),
        }
    }

    /// Fetch `buf.len()` bytes of `vpath` starting at `offset`. Short
    /// reads at end of object are legal.
    pub fn read_remote(&self, vpath: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Backend::Posix(driver) => driver.read_remote(vpath, offset, buf),
            Backend::ObjectStore(driver) => driver.read_remote(vpath, offset, buf),
        }
    }
}

/// Driver for a network (or any POSIX) mount holding the real files.
pub struct PosixMount {
    real_root: PathBuf,
}

impl PosixMount {
    pub fn new(real_root: PathBuf) -> PosixMount {
        PosixMount { real_root }
    }

    fn source_path(&self, vpath: &str) -> PathBuf {
        self.real_root.join(vpath.trim_start_matches('/'))
    }

    fn download_file(&self, vpath: &str, dest: &Path, expected: u64) -> Result<()> {
        let src = File::open(self.source_path(vpath))?;
        let dst = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)?;

        let mut copied: u64 = 0;
        while copied < expected {
            let n = nix::sys::sendfile::sendfile(&dst, &src, None, (expected - copied) as usize)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            if n == 0 {
                break;
            }
            copied += n as u64;
        }
        dst.sync_all()?;

        if copied != expected {
            return Err(BackendError::ShortCopy { copied, expected });
        }
        debug!(vpath, copied, "file copied from mount");
        Ok(())
    }

    fn read_remote(&self, vpath: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let src = File::open(self.source_path(vpath))?;
        Ok(src.read_at(buf, offset)?)
    }
}

/// Driver for a cloud object store, addressed over its XML API.
pub struct ObjectStore {
    bucket: String,
    endpoint: String,
    client: reqwest::blocking::Client,
}

pub const DEFAULT_OBJECT_STORE_ENDPOINT: &str = "https://storage.googleapis.com";

impl ObjectStore {
    pub fn new(bucket: String) -> Result<ObjectStore> {
        Self::with_endpoint(bucket, DEFAULT_OBJECT_STORE_ENDPOINT.to_string())
    }

    pub fn with_endpoint(bucket: String, endpoint: String) -> Result<ObjectStore> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(ObjectStore {
            bucket,
            endpoint,
            client,
        })
    }

    fn object_url(&self, vpath: &str) -> String {
        format!("{}/{}{}", self.endpoint, self.bucket, vpath)
    }

    fn download_file(&self, vpath: &str, dest: &Path) -> Result<()> {
        let mut resp = self.client.get(self.object_url(vpath)).send()?;
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status()));
        }
        let mut dst = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)?;
        let copied = resp.copy_to(&mut dst)?;
        dst.sync_all()?;
        debug!(vpath, copied, "object downloaded");
        Ok(())
    }

    fn read_remote(&self, vpath: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let range = format!("bytes={}-{}", offset, offset + buf.len() as u64 - 1);
        let resp = self
            .client
            .get(self.object_url(vpath))
            .header(reqwest::header::RANGE, range)
            .send()?;
        if resp.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            // Reading at or past end of object.
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status()));
        }
        let body = resp.bytes()?;
        let n = body.len().min(buf.len());
        buf[..n].copy_from_slice(&body[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_joins_bucket_and_path() {
        let store = ObjectStore::with_endpoint(
            "afc-static".to_string(),
            "http://127.0.0.1:9000".to_string(),
        )
        .unwrap();
        assert_eq!(
            store.object_url("/3dep/tile.tif"),
            "http://127.0.0.1:9000/afc-static/3dep/tile.tif"
        );
    }

    #[test]
    fn posix_source_path_strips_leading_slash() {
        let driver = PosixMount::new(PathBuf::from("/mnt/nfs"));
        assert_eq!(
            driver.source_path("/x/y.bin"),
            PathBuf::from("/mnt/nfs/x/y.bin")
        );
    }
}
