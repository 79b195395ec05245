//! Directory iteration over virtual nodes.
//!
//! `readdir` walks the node's child chain in manifest order, reporting
//! `d_type` from the child kind. The cursor sticks at exhaustion: once
//! null, always null until the handle is reopened.

use std::ptr;
use std::sync::Arc;

use libc::DIR;

use crate::fd_table::{DataFd, DirCursor};
use crate::reals;
use crate::state::{ShimGuard, ShimState};

unsafe fn readdir_virtual(state: &ShimState, rec: &Arc<DataFd>) -> *mut libc::dirent {
    let mut cursor = rec.cursor.lock().unwrap_or_else(|e| e.into_inner());
    let next = match *cursor {
        DirCursor::Start => state.tree.first_child(rec.node),
        DirCursor::At(id) => state.tree.next_sibling(id),
        DirCursor::Done => None,
    };
    match next {
        Some(child) => {
            *cursor = DirCursor::At(child);
            let name = state.tree.name(child);
            dbg_data!("readdir({}) {}", rec.vpath, name);
            rec.fill_dirent(name, state.tree.is_dir(child))
        }
        None => {
            *cursor = DirCursor::Done;
            dbg_data!("readdir({}) NULL", rec.vpath);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn readdir(dirp: *mut DIR) -> *mut libc::dirent {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::readdir(dirp);
    };
    let Some(state) = ShimState::get() else {
        return reals::readdir(dirp);
    };
    match state.fds.record_for_dir(dirp as usize) {
        Some(rec) => readdir_virtual(state, &rec),
        None => {
            let ret = reals::readdir(dirp);
            dbg_orig!("readdir({:p})", dirp);
            ret
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn readdir64(dirp: *mut DIR) -> *mut libc::dirent64 {
    let Some(_guard) = ShimGuard::enter() else {
        return reals::readdir64(dirp);
    };
    let Some(state) = ShimState::get() else {
        return reals::readdir64(dirp);
    };
    match state.fds.record_for_dir(dirp as usize) {
        // dirent and dirent64 share a layout on 64-bit Linux.
        Some(rec) => readdir_virtual(state, &rec) as *mut libc::dirent64,
        None => {
            let ret = reals::readdir64(dirp);
            dbg_orig!("readdir64({:p})", dirp);
            ret
        }
    }
}
