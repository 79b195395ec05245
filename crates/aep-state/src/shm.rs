//! Shared-memory segment with the cache-size counter and open-reference
//! table, guarded by a named semaphore.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::ptr;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{slot, Result, StateError, SEGMENT_LEN, SHM_NAME, SHM_SEM_NAME};

/// Handle to the host-wide shared cache state.
///
/// Exactly one process initializes the segment (the `O_CREAT|O_EXCL`
/// winner); it zeroes the memory and seeds the cache-size counter from the
/// files already materialized under the cache root. Every read and write
/// of the counter or of a reference slot happens under the shared
/// semaphore.
pub struct SharedState {
    base: *mut u8,
    sem: *mut libc::sem_t,
}

// The raw pointers refer to a MAP_SHARED segment and a process-shared
// semaphore; all access is serialized through `sem`.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    /// Open (and initialize if first) the default shared state objects.
    pub fn open(cache_root: &Path) -> Result<SharedState> {
        Self::open_named(SHM_NAME, SHM_SEM_NAME, cache_root)
    }

    /// Open the shared state under explicit object names. Production uses
    /// the defaults; tests pass unique names so runs cannot collide.
    pub fn open_named(shm_name: &str, sem_name: &str, cache_root: &Path) -> Result<SharedState> {
        let shm_c = cstring(shm_name)?;
        let sem_c = cstring(sem_name)?;

        let sem = unsafe {
            libc::sem_open(
                sem_c.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(StateError::SemOpen {
                name: sem_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let mut created = true;
        let mut fd = unsafe {
            libc::shm_open(
                shm_c.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            // Lost the creation race; somebody else owns initialization.
            created = false;
            fd = unsafe { libc::shm_open(shm_c.as_ptr(), libc::O_RDWR, 0o666) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::sem_close(sem) };
                return Err(StateError::ShmOpen {
                    name: shm_name.to_string(),
                    source: err,
                });
            }
        }

        sem_wait(sem);
        let state = (|| {
            if created {
                if unsafe { libc::ftruncate(fd, SEGMENT_LEN as libc::off_t) } != 0 {
                    return Err(StateError::Truncate {
                        name: shm_name.to_string(),
                        source: io::Error::last_os_error(),
                    });
                }
            }
            let base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    SEGMENT_LEN,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(StateError::Mmap(io::Error::last_os_error()));
            }

            let state = SharedState {
                base: base as *mut u8,
                sem,
            };
            if created {
                unsafe { ptr::write_bytes(state.base, 0, SEGMENT_LEN) };
                let seed = scan_cache_root(cache_root);
                unsafe { *state.size_ptr() = seed };
                debug!(seed, "shared cache state initialized");
            }
            Ok(state)
        })();
        sem_post(sem);
        unsafe { libc::close(fd) };

        if state.is_err() {
            unsafe { libc::sem_close(sem) };
        }
        state
    }

    /// Remove the named kernel objects. Cleanup helper for tests and for
    /// host maintenance; running workers keep their mappings.
    pub fn unlink_named(shm_name: &str, sem_name: &str) {
        if let Ok(shm_c) = cstring(shm_name) {
            unsafe { libc::shm_unlink(shm_c.as_ptr()) };
        }
        if let Ok(sem_c) = cstring(sem_name) {
            unsafe { libc::sem_unlink(sem_c.as_ptr()) };
        }
    }

    fn size_ptr(&self) -> *mut i64 {
        self.base as *mut i64
    }

    fn refs_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(8) }
    }

    /// Current global cache size in bytes.
    pub fn cache_size(&self) -> i64 {
        sem_wait(self.sem);
        let v = unsafe { *self.size_ptr() };
        sem_post(self.sem);
        v
    }

    /// Adjust the global cache size; returns the new value.
    pub fn add_cache_size(&self, delta: i64) -> i64 {
        sem_wait(self.sem);
        let v = unsafe {
            *self.size_ptr() += delta;
            *self.size_ptr()
        };
        sem_post(self.sem);
        v
    }

    /// Adjust the open-reference count of a virtual path; floors at zero
    /// and returns the new count.
    pub fn ref_add(&self, vpath: &str, delta: i8) -> u8 {
        let slot = slot(vpath);
        sem_wait(self.sem);
        let v = unsafe {
            let p = self.refs_ptr().add(slot);
            let next = (*p as i16 + delta as i16).clamp(0, u8::MAX as i16);
            *p = next as u8;
            *p
        };
        sem_post(self.sem);
        v
    }

    /// Open-reference count of a virtual path.
    pub fn ref_count(&self, vpath: &str) -> u8 {
        let slot = slot(vpath);
        sem_wait(self.sem);
        let v = unsafe { *self.refs_ptr().add(slot) };
        sem_post(self.sem);
        v
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, SEGMENT_LEN);
            libc::sem_close(self.sem);
        }
    }
}

/// Sum of on-disk sizes of every regular file under the cache root.
fn scan_cache_root(cache_root: &Path) -> i64 {
    let mut total: i64 = 0;
    for entry in WalkDir::new(cache_root).into_iter().flatten() {
        if entry.file_type().is_file() {
            match entry.metadata() {
                Ok(meta) => total += meta.len() as i64,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "cache scan skip"),
            }
        }
    }
    total
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| StateError::BadName(name.to_string()))
}

pub(crate) fn sem_wait(sem: *mut libc::sem_t) {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

pub(crate) fn sem_post(sem: *mut libc::sem_t) {
    unsafe { libc::sem_post(sem) };
}
