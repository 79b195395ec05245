//! Descriptor table: every synthetic handle the shim hands to the host.
//!
//! A virtual open gets a *real* kernel descriptor — the opened cache
//! placeholder — so the host can pass it around, `poll` it, or leak it
//! without breaking anything. The record behind the descriptor carries
//! the tree node, the byte offset, and two shadow objects: a stream whose
//! in-memory layout matches the musl `FILE` header (function pointers
//! included, so stdio called through the vtable lands back here) and a
//! musl-layout directory handle. The shim's own interceptors never trust
//! those layouts; they dispatch on pointer identity through the
//! registries below.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::os::unix::io::IntoRawFd;
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use libc::{c_char, c_int, c_long, c_uint, c_void, off_t, size_t, DIR, FILE};

use aep_manifest::NodeId;

use crate::reals;
use crate::state::ShimState;

/// musl `FILE` error flag, cleared by `rewind`.
const F_ERR: c_uint = 32;

/// Shadow stream object in the musl `_IO_FILE` layout.
#[repr(C)]
pub(crate) struct ShadowFile {
    flags: c_uint,
    rpos: *mut u8,
    rend: *mut u8,
    close: Option<unsafe extern "C" fn(*mut FILE) -> c_int>,
    wend: *mut u8,
    wpos: *mut u8,
    mustbezero_1: *mut u8,
    wbase: *mut u8,
    read: Option<unsafe extern "C" fn(*mut FILE, *mut u8, size_t) -> size_t>,
    write: Option<unsafe extern "C" fn(*mut FILE, *const u8, size_t) -> size_t>,
    seek: Option<unsafe extern "C" fn(*mut FILE, off_t, c_int) -> off_t>,
    buf: *mut u8,
    buf_size: size_t,
    prev: *mut FILE,
    next: *mut FILE,
    fd: c_int,
    pipe_pid: c_int,
    lockcount: c_long,
    mode: c_int,
    lock: c_int,
    lbf: c_int,
    cookie: *mut c_void,
    off: off_t,
    getln_buf: *mut c_char,
    mustbezero_2: *mut c_void,
    shend: *mut u8,
    shlim: off_t,
    shcnt: off_t,
    prev_locked: *mut FILE,
    next_locked: *mut FILE,
    locale: *mut c_void,
}

impl ShadowFile {
    fn new(fd: c_int) -> ShadowFile {
        let mut file: ShadowFile = unsafe { std::mem::zeroed() };
        file.fd = fd;
        file.read = Some(shadow_read);
        file.write = Some(shadow_write);
        file.seek = Some(shadow_seek);
        file.close = Some(shadow_close);
        file
    }
}

/// Shadow directory handle in the musl `__dirstream` layout; `fd` is
/// populated so the host's `dirfd()` keeps working.
#[repr(C)]
pub(crate) struct ShadowDir {
    tell: off_t,
    fd: c_int,
    buf_pos: c_int,
    buf_end: c_int,
    lock: [c_int; 1],
    buf: [u8; 2048],
}

impl ShadowDir {
    fn new(fd: c_int) -> ShadowDir {
        let mut dir: ShadowDir = unsafe { std::mem::zeroed() };
        dir.fd = fd;
        dir
    }
}

/// `readdir` cursor over a node's child chain. `Done` is sticky: an
/// exhausted iteration keeps returning null.
pub(crate) enum DirCursor {
    Start,
    At(NodeId),
    Done,
}

/// State behind one synthetic descriptor.
pub(crate) struct DataFd {
    pub node: NodeId,
    /// Manifest size; zero means directory.
    pub size: i64,
    pub vpath: String,
    pub fd: c_int,
    pub off: AtomicI64,
    pub cursor: Mutex<DirCursor>,
    file: Box<UnsafeCell<ShadowFile>>,
    dir: Box<UnsafeCell<ShadowDir>>,
    dirent: UnsafeCell<libc::dirent>,
}

// The shadow objects are handed to the host as raw pointers; all mutation
// from our side goes through the descriptor record.
unsafe impl Send for DataFd {}
unsafe impl Sync for DataFd {}

impl DataFd {
    fn new(node: NodeId, size: i64, vpath: String, fd: c_int) -> Arc<DataFd> {
        Arc::new(DataFd {
            node,
            size,
            vpath,
            fd,
            off: AtomicI64::new(0),
            cursor: Mutex::new(DirCursor::Start),
            file: Box::new(UnsafeCell::new(ShadowFile::new(fd))),
            dir: Box::new(UnsafeCell::new(ShadowDir::new(fd))),
            dirent: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        })
    }

    pub(crate) fn stream_ptr(&self) -> *mut FILE {
        self.file.get() as *mut FILE
    }

    pub(crate) fn dir_ptr(&self) -> *mut DIR {
        self.dir.get() as *mut DIR
    }

    /// Reset stream state the way `rewind` promises: offset zero, error
    /// flag and buffer positions cleared.
    pub(crate) fn reset_stream(&self) {
        self.off.store(0, Ordering::Relaxed);
        unsafe {
            let file = &mut *self.file.get();
            file.flags &= !F_ERR;
            file.rpos = ptr::null_mut();
            file.rend = ptr::null_mut();
            file.wpos = ptr::null_mut();
            file.wbase = ptr::null_mut();
            file.wend = ptr::null_mut();
        }
    }

    /// Fill the per-handle dirent buffer for one child.
    pub(crate) fn fill_dirent(&self, name: &str, is_dir: bool) -> *mut libc::dirent {
        unsafe {
            let d = &mut *self.dirent.get();
            d.d_ino = 0x6ea7ca04;
            d.d_off = 0;
            d.d_reclen = std::mem::size_of::<libc::dirent>() as u16;
            d.d_type = if is_dir { libc::DT_DIR } else { libc::DT_REG };
            let bytes = name.as_bytes();
            let n = bytes.len().min(d.d_name.len() - 1);
            ptr::copy_nonoverlapping(bytes.as_ptr(), d.d_name.as_mut_ptr() as *mut u8, n);
            d.d_name[n] = 0;
            self.dirent.get()
        }
    }
}

/// Process-wide mapping from descriptors (and shadow object addresses) to
/// records. Insertions and removals serialize on the mutexes; reads clone
/// the `Arc` out so no lock is held across blocking IO.
pub(crate) struct FdTable {
    fds: Mutex<HashMap<c_int, Arc<DataFd>>>,
    streams: Mutex<HashMap<usize, c_int>>,
    dirs: Mutex<HashMap<usize, c_int>>,
}

impl FdTable {
    pub(crate) fn new() -> FdTable {
        FdTable {
            fds: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, rec: Arc<DataFd>) {
        self.streams
            .lock()
            .unwrap()
            .insert(rec.stream_ptr() as usize, rec.fd);
        self.dirs
            .lock()
            .unwrap()
            .insert(rec.dir_ptr() as usize, rec.fd);
        self.fds.lock().unwrap().insert(rec.fd, rec);
    }

    pub(crate) fn get(&self, fd: c_int) -> Option<Arc<DataFd>> {
        self.fds.lock().unwrap().get(&fd).cloned()
    }

    pub(crate) fn contains(&self, fd: c_int) -> bool {
        self.fds.lock().unwrap().contains_key(&fd)
    }

    fn take(&self, fd: c_int) -> Option<Arc<DataFd>> {
        let rec = self.fds.lock().unwrap().remove(&fd)?;
        self.streams.lock().unwrap().remove(&(rec.stream_ptr() as usize));
        self.dirs.lock().unwrap().remove(&(rec.dir_ptr() as usize));
        Some(rec)
    }

    pub(crate) fn record_for_stream(&self, addr: usize) -> Option<Arc<DataFd>> {
        let fd = *self.streams.lock().unwrap().get(&addr)?;
        self.get(fd)
    }

    pub(crate) fn record_for_dir(&self, addr: usize) -> Option<Arc<DataFd>> {
        let fd = *self.dirs.lock().unwrap().get(&addr)?;
        self.get(fd)
    }
}

/// Create the synthetic descriptor for a virtual path: look up the node,
/// materialize the cache placeholder, open it, bump the open-reference
/// count, install the record. Returns like `open`.
pub(crate) fn fd_add(state: &ShimState, vpath: &str) -> c_int {
    let Some(node) = state.tree.lookup(vpath) else {
        unsafe { set_errno(libc::ENOENT) };
        return -1;
    };
    let size = state.tree.size(node);
    let file = match state.engine.open_placeholder(vpath, size == 0) {
        Ok(file) => file,
        // The shim just created this placeholder; not being able to open
        // it means the cache root itself is broken.
        Err(e) => aep_abort!("fd_add({vpath}) cache open: {e}"),
    };
    let fd = file.into_raw_fd();
    if size != 0 {
        state.shared.ref_add(vpath, 1);
    }
    state.fds.insert(DataFd::new(node, size, vpath.to_string(), fd));
    dbg_dbg!("fd_add({}) size {:#x} fd {}", vpath, size, fd);
    fd
}

/// Tear down a record: drop the open reference, optionally close the
/// cache descriptor, erase the mapping. Returns false when the fd was
/// never ours, in which case the caller passes through.
pub(crate) fn fd_rm(state: &ShimState, fd: c_int, close_fd: bool) -> bool {
    let Some(rec) = state.fds.take(fd) else {
        return false;
    };
    if rec.size != 0 {
        state.shared.ref_add(&rec.vpath, -1);
    }
    if close_fd {
        unsafe { reals::close(fd) };
    }
    dbg_dbg!("fd_rm({}) done", fd);
    true
}

/// Shared read path: fetch bytes through the cache engine and advance the
/// descriptor offset by what was actually delivered.
pub(crate) fn virt_read(
    state: &ShimState,
    rec: &DataFd,
    buf: *mut c_void,
    count: usize,
) -> isize {
    if count == 0 || buf.is_null() {
        return 0;
    }
    let slice = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, count) };
    let off = rec.off.load(Ordering::Relaxed);
    match state.engine.read(&rec.vpath, rec.size as u64, off as u64, slice) {
        Ok(n) => {
            rec.off.fetch_add(n as i64, Ordering::Relaxed);
            dbg_data!("read_data({}, {}) {}", rec.vpath, count, n);
            n as isize
        }
        // Neither the cache nor the backend could serve the bytes; the
        // virtual read contract is complete-or-abort.
        Err(e) => aep_abort!("read_data({}): {e}", rec.vpath),
    }
}

pub(crate) unsafe fn set_errno(e: c_int) {
    *libc::__errno_location() = e;
}

// --- musl stdio vtable entry points -----------------------------------
//
// Only reached when the host's libc drives a shadow stream through its
// function pointers; the shim's own interceptors dispatch by identity.

unsafe extern "C" fn shadow_read(f: *mut FILE, buf: *mut u8, len: size_t) -> size_t {
    let Some(state) = ShimState::get() else {
        return 0;
    };
    let Some(rec) = state.fds.record_for_stream(f as usize) else {
        return 0;
    };
    virt_read(state, &rec, buf as *mut c_void, len) as size_t
}

unsafe extern "C" fn shadow_write(f: *mut FILE, _buf: *const u8, _len: size_t) -> size_t {
    let vpath = ShimState::get()
        .and_then(|s| s.fds.record_for_stream(f as usize))
        .map(|r| r.vpath.clone())
        .unwrap_or_default();
    aep_abort!("write on virtual stream {vpath}")
}

unsafe extern "C" fn shadow_seek(f: *mut FILE, off: off_t, whence: c_int) -> off_t {
    let Some(state) = ShimState::get() else {
        return -1;
    };
    let Some(rec) = state.fds.record_for_stream(f as usize) else {
        return -1;
    };
    let new = match whence {
        libc::SEEK_SET => off,
        libc::SEEK_CUR => rec.off.load(Ordering::Relaxed) + off,
        libc::SEEK_END => rec.size + off,
        _ => {
            set_errno(libc::EINVAL);
            return -1;
        }
    };
    rec.off.store(new, Ordering::Relaxed);
    dbg_data!("FILE->seek({}, {}, {}) {}", rec.vpath, off, whence, new);
    new
}

unsafe extern "C" fn shadow_close(f: *mut FILE) -> c_int {
    if let Some(state) = ShimState::get() {
        if let Some(rec) = state.fds.record_for_stream(f as usize) {
            fd_rm(state, rec.fd, true);
        }
    }
    0
}
