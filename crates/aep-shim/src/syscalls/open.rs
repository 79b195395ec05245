//! The open family: descriptor, stream, and directory handles.
//!
//! A virtual open never reaches the backend; it verifies the path against
//! the tree, materializes the zero-byte cache placeholder, and returns a
//! handle backed by it. Pass-through opens additionally purge any stale
//! record that happens to sit under the returned descriptor number.

use std::ptr;

use libc::{c_char, c_int, mode_t, DIR, FILE};

use crate::fd_table::{fd_add, fd_rm};
use crate::path;
use crate::reals;
use crate::state::{ShimGuard, ShimState};

type OpenFn = unsafe fn(*const c_char, c_int, mode_t) -> c_int;
type OpenatFn = unsafe fn(c_int, *const c_char, c_int, mode_t) -> c_int;
type FopenFn = unsafe fn(*const c_char, *const c_char) -> *mut FILE;

unsafe fn open_common(path: *const c_char, flags: c_int, mode: mode_t, real: OpenFn) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return real(path, flags, mode);
    };
    let Some(state) = ShimState::get() else {
        return real(path, flags, mode);
    };
    match path::resolve(state, path) {
        Some(vpath) => {
            let fd = fd_add(state, &vpath);
            dbg_data!("open({}, {:#x}) {}", vpath, flags, fd);
            fd
        }
        None => {
            let fd = real(path, flags, mode);
            if fd >= 0 {
                fd_rm(state, fd, false);
            }
            dbg_orig!("open({}, {:#x}) {}", path::display(path), flags, fd);
            fd
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open_common(path, flags, mode, reals::open)
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open_common(path, flags, mode, reals::open64)
}

unsafe fn openat_common(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
    real: OpenatFn,
) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return real(dirfd, path, flags, mode);
    };
    let Some(state) = ShimState::get() else {
        return real(dirfd, path, flags, mode);
    };
    // Classification canonicalizes against the caller's cwd; a relative
    // path under some other dirfd never canonicalizes into the mount.
    match path::resolve(state, path) {
        Some(vpath) => {
            let fd = fd_add(state, &vpath);
            dbg_data!("openat({}, {:#x}) {}", vpath, flags, fd);
            fd
        }
        None => {
            let fd = real(dirfd, path, flags, mode);
            if fd >= 0 {
                fd_rm(state, fd, false);
            }
            dbg_orig!(
                "openat({}, {}, {:#x}) {}",
                dirfd,
                path::display(path),
                flags,
                fd
            );
            fd
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    openat_common(dirfd, path, flags, mode, reals::openat)
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    openat_common(dirfd, path, flags, mode, reals::openat64)
}

unsafe fn fopen_common(path: *const c_char, mode: *const c_char, real: FopenFn) -> *mut FILE {
    let Some(_guard) = ShimGuard::enter() else {
        return real(path, mode);
    };
    let Some(state) = ShimState::get() else {
        return real(path, mode);
    };
    match path::resolve(state, path) {
        Some(vpath) => {
            let fd = fd_add(state, &vpath);
            if fd < 0 {
                dbg_data!("fopen({}) -1", vpath);
                return ptr::null_mut();
            }
            let Some(rec) = state.fds.get(fd) else {
                aep_abort!("fopen({vpath}) record vanished");
            };
            dbg_data!("fopen({}) {}", vpath, fd);
            rec.stream_ptr()
        }
        None => {
            let stream = real(path, mode);
            if !stream.is_null() {
                fd_rm(state, libc::fileno(stream), false);
                dbg_orig!("fopen({}) {}", path::display(path), libc::fileno(stream));
            } else {
                dbg_orig!("fopen({}) -1", path::display(path));
            }
            stream
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    fopen_common(path, mode, reals::fopen)
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    fopen_common(path, mode, reals::fopen64)
}

#[no_mangle]
pub unsafe extern "C" fn opendir(name: *const c_char) -> *mut DIR {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::opendir(name);
    };
    let Some(state) = ShimState::get() else {
        return reals::opendir(name);
    };
    match path::resolve(state, name) {
        Some(vpath) => {
            let fd = fd_add(state, &vpath);
            if fd < 0 {
                dbg_data!("opendir({}) -1", vpath);
                return ptr::null_mut();
            }
            let Some(rec) = state.fds.get(fd) else {
                aep_abort!("opendir({vpath}) record vanished");
            };
            dbg_data!("opendir({}) {}", vpath, fd);
            rec.dir_ptr()
        }
        None => {
            let dirp = reals::opendir(name);
            if !dirp.is_null() {
                fd_rm(state, libc::dirfd(dirp), false);
            }
            dbg_orig!("opendir({})", path::display(name));
            dirp
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn fdopendir(fd: c_int) -> *mut DIR {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::fdopendir(fd);
    };
    let Some(state) = ShimState::get() else {
        return reals::fdopendir(fd);
    };
    match state.fds.get(fd) {
        Some(rec) => {
            dbg_data!("fdopendir({}({}))", fd, rec.vpath);
            rec.dir_ptr()
        }
        None => {
            dbg_orig!("fdopendir({})", fd);
            reals::fdopendir(fd)
        }
    }
}
