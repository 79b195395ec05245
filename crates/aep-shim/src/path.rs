//! Path classification: virtual (under the engine mountpoint) or
//! pass-through.
//!
//! Canonicalization runs against the host's real filesystem view —
//! relative components and symlinks resolve the way the kernel would —
//! and only then is the canonical form tested against the mountpoint
//! prefix. Anything that fails canonicalization belongs to the host.

use std::borrow::Cow;
use std::ffi::CStr;

use libc::c_char;

use crate::state::ShimState;

/// Classify a raw path; `Some` carries the virtual path (absolute, with a
/// leading separator).
pub(crate) unsafe fn resolve(state: &ShimState, path: *const c_char) -> Option<String> {
    if path.is_null() {
        return None;
    }
    let mut buf = [0u8; libc::PATH_MAX as usize];
    let resolved = libc::realpath(path, buf.as_mut_ptr() as *mut c_char);
    if resolved.is_null() {
        return None;
    }
    let canonical = CStr::from_ptr(resolved).to_str().ok()?;
    state.config.strip_virtual(canonical).map(str::to_string)
}

/// Lossy rendition of a raw path for trace lines.
pub(crate) unsafe fn display<'a>(path: *const c_char) -> Cow<'a, str> {
    if path.is_null() {
        Cow::Borrowed("(null)")
    } else {
        CStr::from_ptr(path).to_string_lossy()
    }
}
