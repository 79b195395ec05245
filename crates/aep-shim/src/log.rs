//! Raw debug log stream.
//!
//! Writes go straight to the `AFC_AEP_LOGFILE` descriptor with
//! `libc::write`; no allocation, no locking, no TLS beyond the formatting
//! buffer on the caller's stack.

use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use aep_config::AepConfig;
use libc::c_void;

use crate::macros::StackWriter;

pub(crate) enum Prefix {
    None,
    /// `<pid>: ` — the verbose stream interleaves across workers.
    Pid,
    /// `data ` — virtual-path op trace.
    Data,
    /// `orig ` — pass-through op trace.
    Orig,
}

pub(crate) struct Logger {
    mask: AtomicU32,
    fd: AtomicI32,
}

pub(crate) static LOGGER: Logger = Logger {
    mask: AtomicU32::new(0),
    fd: AtomicI32::new(-1),
};

impl Logger {
    /// Open the logfile and arm the mask. Failure disables debugging with
    /// a diagnostic instead of killing the worker.
    pub(crate) fn configure(&self, config: &AepConfig) {
        if !config.debug.any() {
            return;
        }
        let Some(path) = &config.logfile else {
            return;
        };
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                self.fd.store(file.into_raw_fd(), Ordering::Release);
                self.mask.store(config.debug.bits(), Ordering::Release);
            }
            Err(e) => {
                eprintln!("[aep] can not open {}, log disabled: {e}", path.display());
            }
        }
    }

    pub(crate) fn line(&self, bits: u32, prefix: Prefix, args: fmt::Arguments) {
        if self.mask.load(Ordering::Relaxed) & bits == 0 {
            return;
        }
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let mut buf = [0u8; 512];
        let mut w = StackWriter::new(&mut buf);
        match prefix {
            Prefix::None => {}
            Prefix::Pid => {
                let _ = write!(w, "{}: ", unsafe { libc::getpid() });
            }
            Prefix::Data => {
                let _ = w.write_str("data ");
            }
            Prefix::Orig => {
                let _ = w.write_str("orig ");
            }
        }
        let _ = w.write_fmt(args);
        let _ = w.write_str("\n");
        let msg = w.as_bytes();
        unsafe { libc::write(fd, msg.as_ptr() as *const c_void, msg.len()) };
    }
}

/// Write a diagnostic to stderr and the logfile, then abort the process.
pub(crate) fn abort_with(args: fmt::Arguments) -> ! {
    let mut buf = [0u8; 512];
    let mut w = StackWriter::new(&mut buf);
    let _ = w.write_str("[aep] ");
    let _ = w.write_fmt(args);
    let _ = w.write_str(" Abort!\n");
    let msg = w.as_bytes();
    unsafe {
        libc::write(2, msg.as_ptr() as *const c_void, msg.len());
        let fd = LOGGER.fd.load(Ordering::Acquire);
        if fd >= 0 {
            libc::write(fd, msg.as_ptr() as *const c_void, msg.len());
        }
        libc::abort()
    }
}
