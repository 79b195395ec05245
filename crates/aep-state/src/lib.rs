//! # aep-state
//!
//! The cross-process pieces of the cache: a shared-memory segment holding
//! the global cache-size counter and the open-reference table, guarded by a
//! named semaphore, plus the per-virtual-path lock used to serialize
//! downloads and truncations across worker processes on one host.
//!
//! Layout of the shared segment (host byte order):
//!
//! ```text
//! i64 cache_size; u8 open_refs[HASH_SLOTS];
//! ```

mod lock;
mod shm;

pub use lock::{PathLock, PathLockGuard};
pub use shm::SharedState;

use thiserror::Error;

/// Slots in the open-reference table.
pub const HASH_SLOTS: usize = 65535;

/// Byte length of the shared segment.
pub const SEGMENT_LEN: usize = 8 + HASH_SLOTS;

/// Default names of the kernel objects backing the shared state.
pub const SHM_NAME: &str = "/aep_shmem";
pub const SHM_SEM_NAME: &str = "/aep_shmem_sem";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("shm_open({name}) failed: {source}")]
    ShmOpen {
        name: String,
        source: std::io::Error,
    },

    #[error("sem_open({name}) failed: {source}")]
    SemOpen {
        name: String,
        source: std::io::Error,
    },

    #[error("ftruncate({name}) failed: {source}")]
    Truncate {
        name: String,
        source: std::io::Error,
    },

    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),

    #[error("object name {0:?} contains a NUL byte")]
    BadName(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// 16-bit rolling hash of a virtual path, used to index the
/// open-reference table.
///
/// Folds 16-bit little-endian words of the path (leading `/` skipped, odd
/// tail zero-padded) with an incrementing one-byte mix and a single-bit
/// rotation per word. The rotation makes the fold position-sensitive, so
/// lexically close names such as `USGS_1_n32w099` and `USGS_1_n33w098`
/// land in different slots. Deterministic across processes on one host.
pub fn hash16(vpath: &str) -> u16 {
    let bytes = vpath.as_bytes();
    let bytes = bytes.strip_prefix(b"/").unwrap_or(bytes);

    let mut hash: u16 = 0x5555;
    let mut cor: u8 = 0;
    for pair in bytes.chunks(2) {
        let word = u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]);
        hash = hash.rotate_left(1) ^ word.wrapping_add(cor as u16);
        cor = cor.wrapping_add(1);
    }
    hash
}

/// Open-reference slot of a virtual path.
pub fn slot(vpath: &str) -> usize {
    hash16(vpath) as usize % HASH_SLOTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash16("/3dep/1_arcsec/tile.tif"), hash16("/3dep/1_arcsec/tile.tif"));
    }

    #[test]
    fn similar_names_are_separated() {
        // The raster tile names the mix byte exists for.
        assert_ne!(hash16("/USGS_1_n32w099.tif"), hash16("/USGS_1_n33w098.tif"));
    }

    #[test]
    fn leading_slash_is_skipped() {
        assert_eq!(hash16("/a/b"), hash16("a/b"));
    }

    #[test]
    fn odd_length_tail_is_padded() {
        // Must not read past the end; only check it returns.
        let _ = hash16("/abc");
        let _ = hash16("/");
    }

    #[test]
    fn slot_is_in_table_range() {
        for p in ["/", "/a", "/some/longer/path.bin"] {
            assert!(slot(p) < HASH_SLOTS);
        }
    }
}
