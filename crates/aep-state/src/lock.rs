//! Per-virtual-path lock backed by a named POSIX semaphore.
//!
//! The semaphore name is the virtual path with every inner `/` replaced by
//! `_` (so `/3dep/tile.tif` locks `/3dep_tile.tif`). The kernel object is
//! created on first use with value 1 and persists across processes, which
//! is exactly what serializes two workers racing to materialize the same
//! file. Guards post and close on drop, covering every exit path.

use std::ffi::CString;
use std::io;

use crate::shm::{sem_post, sem_wait};
use crate::{Result, StateError};

pub struct PathLock;

impl PathLock {
    /// Semaphore name for a virtual path.
    pub fn sem_name(vpath: &str) -> String {
        let tail = vpath.strip_prefix('/').unwrap_or(vpath);
        format!("/{}", tail.replace('/', "_"))
    }

    /// Block until the path lock is held.
    pub fn acquire(vpath: &str) -> Result<PathLockGuard> {
        let sem = open_sem(vpath)?;
        sem_wait(sem);
        Ok(PathLockGuard { sem })
    }

    /// Take the lock only if it is free. Used by the eviction walk, which
    /// must never block while the caller already holds another path lock.
    pub fn try_acquire(vpath: &str) -> Result<Option<PathLockGuard>> {
        let sem = open_sem(vpath)?;
        if unsafe { libc::sem_trywait(sem) } == 0 {
            return Ok(Some(PathLockGuard { sem }));
        }
        let err = io::Error::last_os_error();
        unsafe { libc::sem_close(sem) };
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(StateError::SemOpen {
                name: Self::sem_name(vpath),
                source: err,
            }),
        }
    }
}

fn open_sem(vpath: &str) -> Result<*mut libc::sem_t> {
    let name = PathLock::sem_name(vpath);
    let name_c = CString::new(name.as_str()).map_err(|_| StateError::BadName(name.clone()))?;
    let sem = unsafe {
        libc::sem_open(
            name_c.as_ptr(),
            libc::O_CREAT,
            0o666 as libc::c_uint,
            1 as libc::c_uint,
        )
    };
    if sem == libc::SEM_FAILED {
        return Err(StateError::SemOpen {
            name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(sem)
}

pub struct PathLockGuard {
    sem: *mut libc::sem_t,
}

unsafe impl Send for PathLockGuard {}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        sem_post(self.sem);
        unsafe { libc::sem_close(self.sem) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sem_name_flattens_separators() {
        assert_eq!(PathLock::sem_name("/x/y/z.tif"), "/x_y_z.tif");
        assert_eq!(PathLock::sem_name("/flat"), "/flat");
    }

    #[test]
    fn lock_round_trip() {
        let vpath = format!("/aep-lock-test-{}", std::process::id());
        let guard = PathLock::acquire(&vpath).unwrap();
        // Held: try_acquire must refuse without blocking.
        assert!(PathLock::try_acquire(&vpath).unwrap().is_none());
        drop(guard);
        // Released: try_acquire succeeds again.
        let again = PathLock::try_acquire(&vpath).unwrap();
        assert!(again.is_some());
        drop(again);
        unsafe {
            let name = CString::new(PathLock::sem_name(&vpath)).unwrap();
            libc::sem_unlink(name.as_ptr());
        }
    }
}
