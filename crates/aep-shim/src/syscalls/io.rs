//! Read and seek paths for virtual descriptors and streams.
//!
//! Reads route through the cache engine, which serves bytes from the
//! materialized cache file or straight from the backend. Offsets are
//! byte-accurate and advance by what was actually delivered.

use libc::{c_int, c_void, off_t, size_t, ssize_t, FILE};

use crate::fd_table::virt_read;
use crate::reals;
use crate::state::{ShimGuard, ShimState};

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::read(fd, buf, count);
    };
    let Some(state) = ShimState::get() else {
        return reals::read(fd, buf, count);
    };
    match state.fds.get(fd) {
        Some(rec) => virt_read(state, &rec, buf, count),
        None => reals::read(fd, buf, count),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fread(
    ptr: *mut c_void,
    size: size_t,
    nmemb: size_t,
    stream: *mut FILE,
) -> size_t {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::fread(ptr, size, nmemb, stream);
    };
    let Some(state) = ShimState::get() else {
        return reals::fread(ptr, size, nmemb, stream);
    };
    match state.fds.record_for_stream(stream as usize) {
        Some(rec) => {
            if size == 0 {
                return 0;
            }
            let n = virt_read(state, &rec, ptr, size * nmemb);
            n as size_t / size
        }
        None => reals::fread(ptr, size, nmemb, stream),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fgetc(stream: *mut FILE) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::fgetc(stream);
    };
    let Some(state) = ShimState::get() else {
        return reals::fgetc(stream);
    };
    match state.fds.record_for_stream(stream as usize) {
        Some(rec) => {
            let mut byte = 0u8;
            let ret = if virt_read(state, &rec, &mut byte as *mut u8 as *mut c_void, 1) == 1 {
                byte as c_int
            } else {
                libc::EOF
            };
            dbg_data!("fgetc({}({})) {}", rec.fd, rec.vpath, ret);
            ret
        }
        None => reals::fgetc(stream),
    }
}

type LseekFn = unsafe fn(c_int, off_t, c_int) -> off_t;

unsafe fn lseek_common(fd: c_int, offset: off_t, whence: c_int, real: LseekFn) -> off_t {
    let Some(_guard) = ShimGuard::enter() else {
        return real(fd, offset, whence);
    };
    let Some(state) = ShimState::get() else {
        return real(fd, offset, whence);
    };
    match state.fds.get(fd) {
        Some(rec) => {
            // The engine only ever repositions descriptors absolutely;
            // anything else is outside the supported contract.
            if whence != libc::SEEK_SET {
                aep_abort!("lseek({}, {}, {}) unsupported whence", rec.vpath, offset, whence);
            }
            rec.off.store(offset, std::sync::atomic::Ordering::Relaxed);
            dbg_data!("lseek({}({}), {}) {}", fd, rec.vpath, offset, offset);
            offset
        }
        None => {
            let ret = real(fd, offset, whence);
            dbg_orig!("lseek({}, {}, {}) {}", fd, offset, whence, ret);
            ret
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    lseek_common(fd, offset, whence, reals::lseek)
}

#[no_mangle]
pub unsafe extern "C" fn lseek64(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    lseek_common(fd, offset, whence, reals::lseek64)
}

#[no_mangle]
pub unsafe extern "C" fn rewind(stream: *mut FILE) {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::rewind(stream);
    };
    let Some(state) = ShimState::get() else {
        return reals::rewind(stream);
    };
    match state.fds.record_for_stream(stream as usize) {
        Some(rec) => {
            dbg_data!("rewind({}({}))", rec.fd, rec.vpath);
            rec.reset_stream();
        }
        None => reals::rewind(stream),
    }
}
