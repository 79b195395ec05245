//! # aep-shim
//!
//! LD_PRELOAD shim for the propagation engine's static-data reads.
//!
//! Loaded ahead of libc, the shim redirects the engine's file-system calls
//! under the configured mountpoint onto a virtual tree described by a
//! binary manifest. File bytes come either from a host-local cache shared
//! by every worker on the host or straight from the storage backend (a
//! POSIX mount or a cloud object store). The host process is unmodified
//! and unaware: it sees ordinary descriptors, streams, and directory
//! handles.
//!
//! Everything is configured from `AFC_AEP_*` environment variables at
//! library load; a missing mandatory variable, manifest, or shared-state
//! failure aborts the process before the host runs.

#![allow(clippy::missing_safety_doc)]

#[macro_use]
mod macros;

mod fd_table;
mod log;
mod path;
mod reals;
mod state;
mod syscalls;

/// Library entry point. Full initialization happens here so that every
/// interceptor either sees a complete state or passes through.
#[used]
#[link_section = ".init_array"]
static INIT: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        crate::state::ShimState::init();
    }
    init
};
