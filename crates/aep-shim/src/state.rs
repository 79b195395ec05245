//! Process-wide shim state and the re-entrancy guard.
//!
//! The whole context (configuration, tree, engine, shared state,
//! descriptor table) is built once in the library constructor and reached
//! through a single pointer; interceptors that run before it is published
//! pass through. The thread-local guard makes the shim's own file IO —
//! cache files, downloads, the manifest — invisible to itself.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use aep_cache::{Backend, CacheEngine, ObjectStore, PosixMount};
use aep_config::AepConfig;
use aep_manifest::FileTree;
use aep_state::SharedState;

use crate::fd_table::FdTable;
use crate::log::LOGGER;

static SHIM_STATE: AtomicPtr<ShimState> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    static IN_SHIM: Cell<bool> = const { Cell::new(false) };
}

pub(crate) struct ShimState {
    pub config: AepConfig,
    pub tree: FileTree,
    pub engine: CacheEngine,
    pub shared: Arc<SharedState>,
    pub fds: FdTable,
}

impl ShimState {
    pub(crate) fn get() -> Option<&'static ShimState> {
        let ptr = SHIM_STATE.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(&*ptr) }
        }
    }

    /// Build and publish the global state. Called from the library
    /// constructor; every failure here is fatal by contract.
    pub(crate) fn init() {
        if !SHIM_STATE.load(Ordering::Acquire).is_null() {
            return;
        }

        let config = match AepConfig::from_env() {
            Ok(config) => config,
            Err(e) => aep_abort!("{e}"),
        };
        LOGGER.configure(&config);

        let tree = match FileTree::load(&config.filelist) {
            Ok(tree) => tree,
            Err(e) => aep_abort!("filelist {}: {e}", config.filelist.display()),
        };

        let shared = match SharedState::open(&config.cache_root) {
            Ok(shared) => Arc::new(shared),
            Err(e) => aep_abort!("shared state: {e}"),
        };

        let backend = match &config.object_store {
            Some(store) => match ObjectStore::new(store.bucket.clone()) {
                Ok(store) => Backend::ObjectStore(store),
                Err(e) => aep_abort!("object store: {e}"),
            },
            None => Backend::Posix(PosixMount::new(config.real_mountpoint.clone())),
        };
        let engine = CacheEngine::new(
            config.cache_root.clone(),
            config.max_file_size,
            config.max_cache_size,
            backend,
            shared.clone(),
        );

        let state = Box::into_raw(Box::new(ShimState {
            config,
            tree,
            engine,
            shared,
            fds: FdTable::new(),
        }));
        SHIM_STATE.store(state, Ordering::Release);

        unsafe { libc::atexit(dump_statistics) };
        if let Some(state) = ShimState::get() {
            dbg_dbg!("aep init done cs {}", state.shared.cache_size());
        }
    }
}

/// Emit the statistics line (virtual `fclose` and process exit).
pub(crate) fn print_statistics(state: &ShimState) {
    dbg_stat!("{}", state.engine.stats.summary(state.shared.cache_size()));
}

extern "C" fn dump_statistics() {
    if let Some(state) = ShimState::get() {
        print_statistics(state);
    }
}

/// Re-entrancy guard: `enter` fails when this thread is already inside an
/// interceptor, sending nested calls straight to the real symbol.
pub(crate) struct ShimGuard;

impl ShimGuard {
    pub(crate) fn enter() -> Option<ShimGuard> {
        if IN_SHIM.with(|b| b.get()) {
            None
        } else {
            IN_SHIM.with(|b| b.set(true));
            Some(ShimGuard)
        }
    }
}

impl Drop for ShimGuard {
    fn drop(&mut self) {
        IN_SHIM.with(|b| b.set(false));
    }
}
