//! Cache engine behavior against a POSIX mount backend.
//!
//! Virtual paths carry the test pid because per-file lock semaphores are
//! host-global kernel objects.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use aep_cache::{Backend, CacheEngine, PosixMount};
use aep_state::SharedState;
use tempfile::TempDir;

struct Harness {
    _real: TempDir,
    _cache: TempDir,
    real_root: PathBuf,
    cache_root: PathBuf,
    shm: String,
    sem: String,
    state: Arc<SharedState>,
}

impl Harness {
    fn new(tag: &str) -> Harness {
        let real = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let shm = format!("/aep_cache_test_{tag}_{pid}");
        let sem = format!("{shm}_sem");
        let state =
            Arc::new(SharedState::open_named(&shm, &sem, cache.path()).unwrap());
        Harness {
            real_root: real.path().to_path_buf(),
            cache_root: cache.path().to_path_buf(),
            _real: real,
            _cache: cache,
            shm,
            sem,
            state,
        }
    }

    fn engine(&self, max_file: u64, max_cache: u64) -> CacheEngine {
        CacheEngine::new(
            self.cache_root.clone(),
            max_file,
            max_cache,
            Backend::Posix(PosixMount::new(self.real_root.clone())),
            self.state.clone(),
        )
    }

    fn vpath(&self, name: &str) -> String {
        format!("/t{}/{}", std::process::id(), name)
    }

    /// Put a file of `len` patterned bytes on the "remote" mount.
    fn remote_file(&self, vpath: &str, len: usize) -> Vec<u8> {
        let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = self.real_root.join(vpath.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, &body).unwrap();
        body
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        SharedState::unlink_named(&self.shm, &self.sem);
    }
}

#[test]
fn first_read_downloads_and_accounts() {
    let h = Harness::new("dl");
    let engine = h.engine(10_000, 100_000);
    let vpath = h.vpath("x/y");
    let body = h.remote_file(&vpath, 10);
    engine.open_placeholder(&vpath, false).unwrap();

    let mut buf = vec![0u8; 10];
    let n = engine.read(&vpath, 10, 0, &mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(buf, body);

    let cached = fs::read(engine.cache_path(&vpath)).unwrap();
    assert_eq!(cached, body);
    assert_eq!(h.state.cache_size(), 10);
    assert_eq!(engine.stats.download.count(), 1);
    assert_eq!(engine.stats.cached.count(), 1);
    assert_eq!(engine.stats.remote.count(), 0);
}

#[test]
fn second_read_hits_the_cache() {
    let h = Harness::new("hit");
    let engine = h.engine(10_000, 100_000);
    let vpath = h.vpath("a");
    let body = h.remote_file(&vpath, 1000);
    engine.open_placeholder(&vpath, false).unwrap();

    let mut buf = vec![0u8; 1000];
    engine.read(&vpath, 1000, 0, &mut buf).unwrap();
    let n = engine.read(&vpath, 1000, 200, &mut buf[..100]).unwrap();
    assert_eq!(n, 100);
    assert_eq!(&buf[..100], &body[200..300]);

    // Only the first read downloaded; the counter reflects it once.
    assert_eq!(engine.stats.download.count(), 1);
    assert_eq!(h.state.cache_size(), 1000);
}

#[test]
fn eviction_truncates_unreferenced_files() {
    let h = Harness::new("evict");
    let engine = h.engine(1_000, 1_500);
    let a = h.vpath("a");
    let b = h.vpath("b");
    h.remote_file(&a, 1000);
    let body_b = h.remote_file(&b, 1000);
    engine.open_placeholder(&a, false).unwrap();
    engine.open_placeholder(&b, false).unwrap();

    let mut buf = vec![0u8; 1000];
    engine.read(&a, 1000, 0, &mut buf).unwrap();
    assert_eq!(h.state.cache_size(), 1000);

    // B does not fit next to A; A has no open refs and is truncated.
    let n = engine.read(&b, 1000, 0, &mut buf).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, body_b);
    assert_eq!(h.state.cache_size(), 1000);
    assert_eq!(fs::metadata(engine.cache_path(&a)).unwrap().len(), 0);
    assert_eq!(fs::metadata(engine.cache_path(&b)).unwrap().len(), 1000);
}

#[test]
fn open_files_are_never_evicted() {
    let h = Harness::new("gate");
    let engine = h.engine(1_000, 1_500);
    let a = h.vpath("a");
    let b = h.vpath("b");
    let body_a = h.remote_file(&a, 1000);
    let body_b = h.remote_file(&b, 1000);
    engine.open_placeholder(&a, false).unwrap();
    engine.open_placeholder(&b, false).unwrap();

    let mut buf = vec![0u8; 1000];
    engine.read(&a, 1000, 0, &mut buf).unwrap();
    h.state.ref_add(&a, 1);

    // No candidate can be evicted, so B is served remotely, unadmitted.
    let n = engine.read(&b, 1000, 0, &mut buf).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, body_b);
    assert_eq!(h.state.cache_size(), 1000);
    assert_eq!(fs::read(engine.cache_path(&a)).unwrap(), body_a);
    assert_eq!(fs::metadata(engine.cache_path(&b)).unwrap().len(), 0);
    assert_eq!(engine.stats.remote.count(), 1);

    h.state.ref_add(&a, -1);
}

#[test]
fn oversized_files_bypass_the_cache() {
    let h = Harness::new("big");
    let engine = h.engine(100, 100_000);
    let vpath = h.vpath("huge");
    let body = h.remote_file(&vpath, 500);
    engine.open_placeholder(&vpath, false).unwrap();

    let mut buf = vec![0u8; 500];
    let n = engine.read(&vpath, 500, 0, &mut buf).unwrap();
    assert_eq!(n, 500);
    assert_eq!(buf, body);
    assert_eq!(h.state.cache_size(), 0);
    assert_eq!(fs::metadata(engine.cache_path(&vpath)).unwrap().len(), 0);
    assert_eq!(engine.stats.remote.count(), 1);
    assert_eq!(engine.stats.download.count(), 0);
}

#[test]
fn short_read_at_end_of_file() {
    let h = Harness::new("eof");
    let engine = h.engine(10_000, 100_000);
    let vpath = h.vpath("tail");
    let body = h.remote_file(&vpath, 100);
    engine.open_placeholder(&vpath, false).unwrap();

    let mut buf = vec![0u8; 64];
    let n = engine.read(&vpath, 100, 90, &mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf[..10], &body[90..]);
}

#[test]
fn failed_download_leaves_placeholder_and_retries() {
    let h = Harness::new("retry");
    let engine = h.engine(10_000, 100_000);
    let vpath = h.vpath("flaky");
    // The mount holds fewer bytes than the manifest claims: the download
    // is rejected and the read is served remotely.
    let partial = h.remote_file(&vpath, 60);
    engine.open_placeholder(&vpath, false).unwrap();

    let mut buf = vec![0u8; 60];
    let n = engine.read(&vpath, 100, 0, &mut buf).unwrap();
    assert_eq!(n, 60);
    assert_eq!(buf, partial);
    assert_ne!(
        fs::metadata(engine.cache_path(&vpath)).unwrap().len(),
        100,
        "placeholder must not look materialized"
    );
    assert_eq!(h.state.cache_size(), 0);

    // The mount recovers; the next read downloads cleanly.
    let body = h.remote_file(&vpath, 100);
    let mut buf = vec![0u8; 100];
    let n = engine.read(&vpath, 100, 0, &mut buf).unwrap();
    assert_eq!(n, 100);
    assert_eq!(buf, body);
    assert_eq!(h.state.cache_size(), 100);
}

#[test]
fn directory_placeholders_mirror_the_tree() {
    let h = Harness::new("dirs");
    let engine = h.engine(10_000, 100_000);
    let dir = h.vpath("nested/dir");
    engine.open_placeholder(&dir, true).unwrap();
    assert!(engine.cache_path(&dir).is_dir());
}
