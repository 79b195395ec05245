//! Logging macros and the stack-buffer formatter behind them.
//!
//! The shim cannot route its hot path through an allocating logger: these
//! macros format into a fixed stack buffer and hand the bytes to the raw
//! logfile descriptor.

/// Verbose internal tracing, pid-prefixed.
macro_rules! dbg_dbg {
    ($($arg:tt)*) => {
        $crate::log::LOGGER.line(
            ::aep_config::DebugMask::DEBUG,
            $crate::log::Prefix::Pid,
            format_args!($($arg)*),
        )
    };
}

/// Per-op trace of virtual-path calls.
macro_rules! dbg_data {
    ($($arg:tt)*) => {
        $crate::log::LOGGER.line(
            ::aep_config::DebugMask::VIRTUAL,
            $crate::log::Prefix::Data,
            format_args!($($arg)*),
        )
    };
}

/// Per-op trace of pass-through calls.
macro_rules! dbg_orig {
    ($($arg:tt)*) => {
        $crate::log::LOGGER.line(
            ::aep_config::DebugMask::PASSTHROUGH,
            $crate::log::Prefix::Orig,
            format_args!($($arg)*),
        )
    };
}

/// Summary statistics line; one emission no matter how many of the
/// selected streams cover it.
macro_rules! dbg_stat {
    ($($arg:tt)*) => {
        $crate::log::LOGGER.line(
            ::aep_config::DebugMask::STATS | ::aep_config::DebugMask::DEBUG,
            $crate::log::Prefix::None,
            format_args!($($arg)*),
        )
    };
}

/// Diagnostic to stderr (and the logfile when open), then abort. Used when
/// the host steps outside the supported contract or a shim-guaranteed
/// invariant fails.
macro_rules! aep_abort {
    ($($arg:tt)*) => {
        $crate::log::abort_with(format_args!($($arg)*))
    };
}

/// `fmt::Write` into a fixed stack buffer; output past the end is dropped.
pub(crate) struct StackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> StackWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> StackWriter<'a> {
        StackWriter { buf, pos: 0 }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

impl std::fmt::Write for StackWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(self.buf.len() - self.pos);
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.pos += to_copy;
        Ok(())
    }
}
