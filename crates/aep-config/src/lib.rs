//! # aep-config
//!
//! Process-start configuration for the engine preload shim.
//!
//! There is no config file: everything is read once from `AFC_AEP_*`
//! environment variables when the shim library is loaded. A mandatory
//! variable that is missing or malformed is fatal at init; the shim turns
//! the error returned here into an abort diagnostic.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors raised while reading the `AFC_AEP_*` environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var is not defined")]
    Missing(&'static str),

    #[error("{var} is not a valid byte count: {value:?}")]
    BadSize { var: &'static str, value: String },

    #[error("{var} path does not exist: {path}")]
    BadPath { var: &'static str, path: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Debug stream selection, a bitmask parsed from `AFC_AEP_DEBUG`.
///
/// Bits may be combined; each event is emitted at most once no matter how
/// many selected streams it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugMask(u32);

impl DebugMask {
    /// Summary statistics (downloads, hits, bytes, microseconds).
    pub const STATS: u32 = 1;
    /// Verbose internal tracing.
    pub const DEBUG: u32 = 2;
    /// Per-op trace of pass-through calls.
    pub const PASSTHROUGH: u32 = 4;
    /// Per-op trace of virtual-path calls.
    pub const VIRTUAL: u32 = 8;

    pub fn from_bits(bits: u32) -> Self {
        DebugMask(bits)
    }

    pub fn enabled(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DebugMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Object-store driver settings (`AFC_AEP_GS`).
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
}

/// The full shim configuration, immutable after init.
#[derive(Debug, Clone)]
pub struct AepConfig {
    /// Prefix under which the static data really lives (POSIX driver).
    pub real_mountpoint: PathBuf,
    /// Canonical prefix the engine thinks it is reading from. Accesses
    /// under this prefix are virtualized.
    pub engine_mountpoint: String,
    /// Path to the binary file-list manifest.
    pub filelist: PathBuf,
    /// Host-local cache root shared by every worker on the host.
    pub cache_root: PathBuf,
    /// Largest single file admitted to the cache, clamped to `max_cache_size`.
    pub max_file_size: u64,
    /// Total cache size bound enforced by eviction.
    pub max_cache_size: u64,
    /// Present when the object-store driver is selected instead of POSIX.
    pub object_store: Option<ObjectStoreConfig>,
    pub debug: DebugMask,
    /// Debug output file; always present when `debug` has any bit set.
    pub logfile: Option<PathBuf>,
}

impl AepConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<AepConfig> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(get: F) -> Result<AepConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut debug = DebugMask::from_bits(
            get("AFC_AEP_DEBUG")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0),
        );
        let logfile = get("AFC_AEP_LOGFILE").map(PathBuf::from);
        if debug.any() && logfile.is_none() {
            // Matches the engine's behavior: a missing logfile disables
            // debugging instead of killing the worker.
            eprintln!("[aep] AFC_AEP_LOGFILE env var is not defined, log disabled");
            debug = DebugMask::default();
        }

        let real_mountpoint = canonical_dir(&get, "AFC_AEP_REAL_MOUNTPOINT")?;
        let engine_mountpoint = canonical_dir(&get, "AFC_AEP_ENGINE_MOUNTPOINT")?
            .to_string_lossy()
            .into_owned();

        let filelist = PathBuf::from(required(&get, "AFC_AEP_FILELIST")?);
        let cache_root = PathBuf::from(required(&get, "AFC_AEP_CACHE")?);

        let max_file_size = byte_count(&get, "AFC_AEP_CACHE_MAX_FILE_SIZE")?;
        let max_cache_size = byte_count(&get, "AFC_AEP_CACHE_MAX_SIZE")?;
        // The effective per-file cap can never exceed the whole cache.
        let max_file_size = max_file_size.min(max_cache_size);

        let object_store = if get("AFC_AEP_GS").is_some() {
            Some(ObjectStoreConfig {
                bucket: required(&get, "AFC_AEP_GS_BUCKET_NAME")?,
            })
        } else {
            None
        };

        let config = AepConfig {
            real_mountpoint,
            engine_mountpoint,
            filelist,
            cache_root,
            max_file_size,
            max_cache_size,
            object_store,
            debug,
            logfile,
        };
        debug!(?config, "aep configuration loaded");
        Ok(config)
    }

    /// Classify a canonical path against the engine mountpoint.
    ///
    /// Returns the virtual path (always absolute, `/` for the mountpoint
    /// itself) when the path lies under the mount, or `None` for
    /// pass-through. The boundary is component-aware: `/mnt/engine2` is not
    /// under `/mnt/engine`.
    pub fn strip_virtual<'a>(&self, canonical: &'a str) -> Option<&'a str> {
        let rest = canonical.strip_prefix(&self.engine_mountpoint)?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

fn required<F>(get: &F, var: &'static str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(var).ok_or(ConfigError::Missing(var))
}

fn byte_count<F>(get: &F, var: &'static str) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = required(get, var)?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::BadSize { var, value })
}

fn canonical_dir<F>(get: &F, var: &'static str) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = required(get, var)?;
    Path::new(&raw)
        .canonicalize()
        .map_err(|_| ConfigError::BadPath { var, path: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env(dir: &Path) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "AFC_AEP_REAL_MOUNTPOINT".into(),
            dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "AFC_AEP_ENGINE_MOUNTPOINT".into(),
            dir.to_string_lossy().into_owned(),
        );
        env.insert("AFC_AEP_FILELIST".into(), "/tmp/filelist.bin".into());
        env.insert("AFC_AEP_CACHE".into(), "/tmp/aep-cache".into());
        env.insert("AFC_AEP_CACHE_MAX_FILE_SIZE".into(), "1000".into());
        env.insert("AFC_AEP_CACHE_MAX_SIZE".into(), "5000".into());
        env
    }

    fn load(env: &HashMap<String, String>) -> Result<AepConfig> {
        AepConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn loads_mandatory_vars() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&base_env(dir.path())).unwrap();
        assert_eq!(config.max_file_size, 1000);
        assert_eq!(config.max_cache_size, 5000);
        assert!(config.object_store.is_none());
        assert!(!config.debug.any());
    }

    #[test]
    fn missing_mandatory_var_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path());
        env.remove("AFC_AEP_CACHE_MAX_SIZE");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("AFC_AEP_CACHE_MAX_SIZE"))
        ));
    }

    #[test]
    fn nonexistent_mountpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path());
        env.insert(
            "AFC_AEP_ENGINE_MOUNTPOINT".into(),
            "/definitely/not/here".into(),
        );
        assert!(matches!(load(&env), Err(ConfigError::BadPath { .. })));
    }

    #[test]
    fn per_file_cap_clamps_to_total() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path());
        env.insert("AFC_AEP_CACHE_MAX_FILE_SIZE".into(), "90000".into());
        let config = load(&env).unwrap();
        assert_eq!(config.max_file_size, 5000);
    }

    #[test]
    fn object_store_requires_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path());
        env.insert("AFC_AEP_GS".into(), "1".into());
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("AFC_AEP_GS_BUCKET_NAME"))
        ));
        env.insert("AFC_AEP_GS_BUCKET_NAME".into(), "afc-static".into());
        let config = load(&env).unwrap();
        assert_eq!(config.object_store.unwrap().bucket, "afc-static");
    }

    #[test]
    fn debug_without_logfile_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path());
        env.insert("AFC_AEP_DEBUG".into(), "15".into());
        let config = load(&env).unwrap();
        assert!(!config.debug.any());

        env.insert("AFC_AEP_LOGFILE".into(), "/tmp/aep.log".into());
        let config = load(&env).unwrap();
        assert!(config.debug.enabled(DebugMask::STATS));
        assert!(config.debug.enabled(DebugMask::VIRTUAL));
    }

    #[test]
    fn strip_virtual_is_boundary_aware() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&base_env(dir.path())).unwrap();
        let mount = config.engine_mountpoint.clone();

        assert_eq!(
            config.strip_virtual(&format!("{mount}/x/y")),
            Some("/x/y")
        );
        assert_eq!(config.strip_virtual(&mount), Some("/"));
        assert_eq!(config.strip_virtual(&format!("{mount}2/x")), None);
        assert_eq!(config.strip_virtual("/somewhere/else"), None);
    }
}
