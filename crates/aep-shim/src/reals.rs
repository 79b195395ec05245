//! Next-symbol resolution for every intercepted libc entry point.
//!
//! Each symbol is looked up once with `dlsym(RTLD_NEXT, …)` and cached in
//! an atomic; the typed wrappers below are what the rest of the shim (and
//! every pass-through branch) calls.

use std::mem;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::{c_char, c_int, c_long, c_uint, c_void, mode_t, off_t, size_t, ssize_t, DIR, FILE};

pub(crate) struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    name: &'static str,
}

impl RealSymbol {
    pub(crate) const fn new(name: &'static str) -> RealSymbol {
        RealSymbol {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            name,
        }
    }

    pub(crate) unsafe fn get(&self) -> *mut c_void {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            return p;
        }
        let f = libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char);
        self.ptr.store(f, Ordering::Release);
        f
    }
}

static REAL_OPEN: RealSymbol = RealSymbol::new("open\0");
static REAL_OPEN64: RealSymbol = RealSymbol::new("open64\0");
static REAL_OPENAT: RealSymbol = RealSymbol::new("openat\0");
static REAL_OPENAT64: RealSymbol = RealSymbol::new("openat64\0");
static REAL_FOPEN: RealSymbol = RealSymbol::new("fopen\0");
static REAL_FOPEN64: RealSymbol = RealSymbol::new("fopen64\0");
static REAL_CLOSE: RealSymbol = RealSymbol::new("close\0");
static REAL_FCLOSE: RealSymbol = RealSymbol::new("fclose\0");
static REAL_READ: RealSymbol = RealSymbol::new("read\0");
static REAL_FREAD: RealSymbol = RealSymbol::new("fread\0");
static REAL_FGETC: RealSymbol = RealSymbol::new("fgetc\0");
static REAL_LSEEK: RealSymbol = RealSymbol::new("lseek\0");
static REAL_LSEEK64: RealSymbol = RealSymbol::new("lseek64\0");
static REAL_REWIND: RealSymbol = RealSymbol::new("rewind\0");
static REAL_STAT: RealSymbol = RealSymbol::new("stat\0");
static REAL_STAT64: RealSymbol = RealSymbol::new("stat64\0");
static REAL_FSTAT: RealSymbol = RealSymbol::new("fstat\0");
static REAL_FSTAT64: RealSymbol = RealSymbol::new("fstat64\0");
static REAL_LSTAT: RealSymbol = RealSymbol::new("lstat\0");
static REAL_LSTAT64: RealSymbol = RealSymbol::new("lstat64\0");
static REAL_STATX: RealSymbol = RealSymbol::new("statx\0");
static REAL_ACCESS: RealSymbol = RealSymbol::new("access\0");
static REAL_OPENDIR: RealSymbol = RealSymbol::new("opendir\0");
static REAL_FDOPENDIR: RealSymbol = RealSymbol::new("fdopendir\0");
static REAL_READDIR: RealSymbol = RealSymbol::new("readdir\0");
static REAL_READDIR64: RealSymbol = RealSymbol::new("readdir64\0");
static REAL_CLOSEDIR: RealSymbol = RealSymbol::new("closedir\0");
static REAL_FCNTL: RealSymbol = RealSymbol::new("fcntl\0");
static REAL_FCNTL64: RealSymbol = RealSymbol::new("fcntl64\0");

pub(crate) unsafe fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int =
        mem::transmute(REAL_OPEN.get());
    f(path, flags, mode)
}

pub(crate) unsafe fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int =
        mem::transmute(REAL_OPEN64.get());
    f(path, flags, mode)
}

pub(crate) unsafe fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let f: unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int =
        mem::transmute(REAL_OPENAT.get());
    f(dirfd, path, flags, mode)
}

pub(crate) unsafe fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let f: unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int =
        mem::transmute(REAL_OPENAT64.get());
    f(dirfd, path, flags, mode)
}

pub(crate) unsafe fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let f: unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE =
        mem::transmute(REAL_FOPEN.get());
    f(path, mode)
}

pub(crate) unsafe fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let f: unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE =
        mem::transmute(REAL_FOPEN64.get());
    f(path, mode)
}

pub(crate) unsafe fn close(fd: c_int) -> c_int {
    let f: unsafe extern "C" fn(c_int) -> c_int = mem::transmute(REAL_CLOSE.get());
    f(fd)
}

pub(crate) unsafe fn fclose(stream: *mut FILE) -> c_int {
    let f: unsafe extern "C" fn(*mut FILE) -> c_int = mem::transmute(REAL_FCLOSE.get());
    f(stream)
}

pub(crate) unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let f: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t =
        mem::transmute(REAL_READ.get());
    f(fd, buf, count)
}

pub(crate) unsafe fn fread(
    ptr: *mut c_void,
    size: size_t,
    nmemb: size_t,
    stream: *mut FILE,
) -> size_t {
    let f: unsafe extern "C" fn(*mut c_void, size_t, size_t, *mut FILE) -> size_t =
        mem::transmute(REAL_FREAD.get());
    f(ptr, size, nmemb, stream)
}

pub(crate) unsafe fn fgetc(stream: *mut FILE) -> c_int {
    let f: unsafe extern "C" fn(*mut FILE) -> c_int = mem::transmute(REAL_FGETC.get());
    f(stream)
}

pub(crate) unsafe fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    let f: unsafe extern "C" fn(c_int, off_t, c_int) -> off_t = mem::transmute(REAL_LSEEK.get());
    f(fd, offset, whence)
}

pub(crate) unsafe fn lseek64(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    let f: unsafe extern "C" fn(c_int, off_t, c_int) -> off_t = mem::transmute(REAL_LSEEK64.get());
    f(fd, offset, whence)
}

pub(crate) unsafe fn rewind(stream: *mut FILE) {
    let f: unsafe extern "C" fn(*mut FILE) = mem::transmute(REAL_REWIND.get());
    f(stream)
}

pub(crate) unsafe fn stat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int =
        mem::transmute(REAL_STAT.get());
    f(path, buf)
}

pub(crate) unsafe fn stat64(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, *mut libc::stat64) -> c_int =
        mem::transmute(REAL_STAT64.get());
    f(path, buf)
}

pub(crate) unsafe fn fstat(fd: c_int, buf: *mut libc::stat) -> c_int {
    let f: unsafe extern "C" fn(c_int, *mut libc::stat) -> c_int = mem::transmute(REAL_FSTAT.get());
    f(fd, buf)
}

pub(crate) unsafe fn fstat64(fd: c_int, buf: *mut libc::stat64) -> c_int {
    let f: unsafe extern "C" fn(c_int, *mut libc::stat64) -> c_int =
        mem::transmute(REAL_FSTAT64.get());
    f(fd, buf)
}

pub(crate) unsafe fn lstat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int =
        mem::transmute(REAL_LSTAT.get());
    f(path, buf)
}

pub(crate) unsafe fn lstat64(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, *mut libc::stat64) -> c_int =
        mem::transmute(REAL_LSTAT64.get());
    f(path, buf)
}

pub(crate) unsafe fn statx(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mask: c_uint,
    buf: *mut libc::statx,
) -> c_int {
    let f: unsafe extern "C" fn(c_int, *const c_char, c_int, c_uint, *mut libc::statx) -> c_int =
        mem::transmute(REAL_STATX.get());
    f(dirfd, path, flags, mask, buf)
}

pub(crate) unsafe fn access(path: *const c_char, mode: c_int) -> c_int {
    let f: unsafe extern "C" fn(*const c_char, c_int) -> c_int = mem::transmute(REAL_ACCESS.get());
    f(path, mode)
}

pub(crate) unsafe fn opendir(name: *const c_char) -> *mut DIR {
    let f: unsafe extern "C" fn(*const c_char) -> *mut DIR = mem::transmute(REAL_OPENDIR.get());
    f(name)
}

pub(crate) unsafe fn fdopendir(fd: c_int) -> *mut DIR {
    let f: unsafe extern "C" fn(c_int) -> *mut DIR = mem::transmute(REAL_FDOPENDIR.get());
    f(fd)
}

pub(crate) unsafe fn readdir(dirp: *mut DIR) -> *mut libc::dirent {
    let f: unsafe extern "C" fn(*mut DIR) -> *mut libc::dirent =
        mem::transmute(REAL_READDIR.get());
    f(dirp)
}

pub(crate) unsafe fn readdir64(dirp: *mut DIR) -> *mut libc::dirent64 {
    let f: unsafe extern "C" fn(*mut DIR) -> *mut libc::dirent64 =
        mem::transmute(REAL_READDIR64.get());
    f(dirp)
}

pub(crate) unsafe fn closedir(dirp: *mut DIR) -> c_int {
    let f: unsafe extern "C" fn(*mut DIR) -> c_int = mem::transmute(REAL_CLOSEDIR.get());
    f(dirp)
}

pub(crate) unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let f: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int = mem::transmute(REAL_FCNTL.get());
    f(fd, cmd, arg)
}

pub(crate) unsafe fn fcntl64(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let f: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int = mem::transmute(REAL_FCNTL64.get());
    f(fd, cmd, arg)
}
