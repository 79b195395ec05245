//! Metadata for virtual paths and descriptors.
//!
//! Virtual nodes are reported from a fixed template: read-only regular
//! file or traversable directory, size from the manifest, blocks rounded
//! up from the size. The manifest is authoritative, so no backend or
//! cache IO happens here.

use libc::{c_char, c_int, c_uint};

use crate::path;
use crate::reals;
use crate::state::{ShimGuard, ShimState};

use crate::fd_table::set_errno;

/// Fill a `stat`-shaped buffer from the template. Works for both
/// `libc::stat` and `libc::stat64`, whose field names match.
macro_rules! fill_stat_template {
    ($buf:expr, $size:expr) => {{
        std::ptr::write_bytes($buf, 0, 1);
        let st = &mut *$buf;
        st.st_dev = 0x72;
        st.st_ino = 0x6ea7ca04;
        st.st_nlink = 1;
        st.st_uid = 0x4466;
        st.st_gid = 0x592;
        st.st_blksize = 0x80000;
        st.st_atime = 0x63b45b04;
        st.st_mtime = 0x63b45b04;
        st.st_ctime = 0x63b45b04;
        if $size != 0 {
            st.st_mode = libc::S_IFREG | libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH;
            st.st_size = $size;
            st.st_blocks = ($size + 511) / 512;
        } else {
            st.st_mode = libc::S_IFDIR | libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO;
        }
    }};
}

macro_rules! stat_path_shim {
    ($name:ident, $buf_ty:ty, $real:path) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(path: *const c_char, buf: *mut $buf_ty) -> c_int {
            let Some(_guard) = ShimGuard::enter() else {
                return $real(path, buf);
            };
            let Some(state) = ShimState::get() else {
                return $real(path, buf);
            };
            match path::resolve(state, path) {
                Some(vpath) => match state.tree.lookup(&vpath) {
                    Some(node) => {
                        let size = state.tree.size(node);
                        fill_stat_template!(buf, size);
                        dbg_data!(
                            concat!(stringify!($name), "({}, {:#x})"),
                            vpath,
                            size
                        );
                        0
                    }
                    None => {
                        set_errno(libc::ENOENT);
                        -1
                    }
                },
                None => {
                    let ret = $real(path, buf);
                    dbg_orig!(
                        concat!(stringify!($name), "({}) {}"),
                        path::display(path),
                        ret
                    );
                    ret
                }
            }
        }
    };
}

stat_path_shim!(stat, libc::stat, reals::stat);
stat_path_shim!(stat64, libc::stat64, reals::stat64);
// lstat mirrors stat: the virtual tree holds no symlinks, so the
// non-following variant sees the same nodes.
stat_path_shim!(lstat, libc::stat, reals::lstat);
stat_path_shim!(lstat64, libc::stat64, reals::lstat64);

macro_rules! fstat_shim {
    ($name:ident, $buf_ty:ty, $real:path) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(fd: c_int, buf: *mut $buf_ty) -> c_int {
            let Some(_guard) = ShimGuard::enter() else {
                return $real(fd, buf);
            };
            let Some(state) = ShimState::get() else {
                return $real(fd, buf);
            };
            match state.fds.get(fd) {
                Some(rec) => {
                    fill_stat_template!(buf, rec.size);
                    dbg_data!(
                        concat!(stringify!($name), "({}({}), {:#x})"),
                        fd,
                        rec.vpath,
                        rec.size
                    );
                    0
                }
                None => {
                    let ret = $real(fd, buf);
                    dbg_orig!(concat!(stringify!($name), "({}) {}"), fd, ret);
                    ret
                }
            }
        }
    };
}

fstat_shim!(fstat, libc::stat, reals::fstat);
fstat_shim!(fstat64, libc::stat64, reals::fstat64);

unsafe fn fill_statx_template(buf: *mut libc::statx, size: i64) {
    std::ptr::write_bytes(buf, 0, 1);
    let st = &mut *buf;
    st.stx_mask = 0x17ff;
    st.stx_blksize = 0x80000;
    st.stx_nlink = 1;
    st.stx_uid = 0x4466;
    st.stx_gid = 0x592;
    st.stx_ino = 0x6ea7ca04;
    st.stx_attributes_mask = 0x203000;
    st.stx_dev_minor = 0x72;
    st.stx_atime.tv_sec = 0x63b45b04;
    st.stx_btime.tv_sec = 0x63b45b04;
    st.stx_ctime.tv_sec = 0x63b45b04;
    st.stx_mtime.tv_sec = 0x63b45b04;
    if size != 0 {
        st.stx_mode = (libc::S_IFREG | libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH) as u16;
        st.stx_size = size as u64;
        st.stx_blocks = ((size + 511) / 512) as u64;
    } else {
        st.stx_mode = (libc::S_IFDIR | libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO) as u16;
    }
}

#[no_mangle]
pub unsafe extern "C" fn statx(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mask: c_uint,
    buf: *mut libc::statx,
) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::statx(dirfd, path, flags, mask, buf);
    };
    let Some(state) = ShimState::get() else {
        return reals::statx(dirfd, path, flags, mask, buf);
    };
    match path::resolve(state, path) {
        Some(vpath) => match state.tree.lookup(&vpath) {
            Some(node) => {
                let size = state.tree.size(node);
                fill_statx_template(buf, size);
                dbg_data!("statx({}, {:#x}, {:#x}) {:#x}", vpath, flags, mask, size);
                0
            }
            None => {
                dbg_data!("statx({}) -1", vpath);
                set_errno(libc::ENOENT);
                -1
            }
        },
        None => {
            let ret = reals::statx(dirfd, path, flags, mask, buf);
            dbg_orig!("statx({}, {}) {}", dirfd, path::display(path), ret);
            ret
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn access(path: *const c_char, mode: c_int) -> c_int {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::access(path, mode);
    };
    let Some(state) = ShimState::get() else {
        return reals::access(path, mode);
    };
    match path::resolve(state, path) {
        Some(vpath) => {
            let ret = if state.tree.lookup(&vpath).is_some() {
                0
            } else {
                set_errno(libc::ENOENT);
                -1
            };
            dbg_data!("access({}, {}) {}", vpath, mode, ret);
            ret
        }
        None => {
            let ret = reals::access(path, mode);
            dbg_orig!("access({}, {}) {}", path::display(path), mode, ret);
            ret
        }
    }
}
