//! `fcntl` on virtual descriptors.
//!
//! The engine takes advisory locks on its data files; on a read-only
//! virtual tree those are meaningless, so `F_SETLK` is accepted as a
//! no-op. Every other command on a virtual descriptor is outside the
//! supported contract. Pass-through forwards the third argument as one
//! register-sized value, which covers the integer and pointer forms the
//! fixed command subset uses.

use libc::{c_int, c_long};

use crate::reals;
use crate::state::{ShimGuard, ShimState};

type FcntlFn = unsafe fn(c_int, c_int, c_long) -> c_int;

unsafe fn fcntl_common(fd: c_int, cmd: c_int, arg: c_long, real: FcntlFn) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return real(fd, cmd, arg);
    };
    let Some(state) = ShimState::get() else {
        return real(fd, cmd, arg);
    };
    match state.fds.get(fd) {
        Some(rec) => {
            if cmd != libc::F_SETLK {
                aep_abort!("fcntl({}) unsupported cmd={}", rec.vpath, cmd);
            }
            dbg_data!("fcntl({}, F_SETLK)", rec.vpath);
            0
        }
        None => {
            let ret = real(fd, cmd, arg);
            dbg_orig!("fcntl({}, {}) {}", fd, cmd, ret);
            ret
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    fcntl_common(fd, cmd, arg, reals::fcntl)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl64(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    fcntl_common(fd, cmd, arg, reals::fcntl64)
}
