//! The close family. Virtual handles drop their open reference and cache
//! descriptor; everything else goes to libc untouched.

use libc::{c_int, DIR, FILE};

use crate::fd_table::fd_rm;
use crate::reals;
use crate::state::{print_statistics, ShimGuard, ShimState};

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::close(fd);
    };
    let Some(state) = ShimState::get() else {
        return reals::close(fd);
    };
    if state.fds.contains(fd) {
        dbg_data!("close({})", fd);
        fd_rm(state, fd, true);
        0
    } else {
        let ret = reals::close(fd);
        dbg_orig!("close({}) {}", fd, ret);
        ret
    }
}

#[no_mangle]
pub unsafe extern "C" fn fclose(stream: *mut FILE) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::fclose(stream);
    };
    let Some(state) = ShimState::get() else {
        return reals::fclose(stream);
    };
    match state.fds.record_for_stream(stream as usize) {
        Some(rec) => {
            dbg_data!("fclose({}({}))", rec.fd, rec.vpath);
            fd_rm(state, rec.fd, true);
            print_statistics(state);
            0
        }
        None => {
            let ret = reals::fclose(stream);
            dbg_orig!("fclose({:p}) {}", stream, ret);
            ret
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn closedir(dirp: *mut DIR) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::closedir(dirp);
    };
    let Some(state) = ShimState::get() else {
        return reals::closedir(dirp);
    };
    match state.fds.record_for_dir(dirp as usize) {
        Some(rec) => {
            dbg_data!("closedir({}({}))", rec.fd, rec.vpath);
            fd_rm(state, rec.fd, true);
            0
        }
        None => {
            dbg_orig!("closedir({:p})", dirp);
            reals::closedir(dirp)
        }
    }
}
