use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::identity::IdentityPolicy;

pub const ENV_DB: &str = "ANNOCACHE_DB";
pub const ENV_DISABLED: &str = "ANNOCACHE_DISABLED";
pub const ENV_READ_ONLY: &str = "ANNOCACHE_READ_ONLY";
pub const ENV_ALWAYS_VALID: &str = "ANNOCACHE_ALWAYS_VALID";
pub const ENV_DIGEST: &str = "ANNOCACHE_DIGEST";
pub const ENV_THREADS: &str = "ANNOCACHE_THREADS";
pub const ENV_LOG_QUERIES: &str = "ANNOCACHE_LOG_QUERIES";

pub const DEFAULT_PLATFORM_PREFIXES: [&str; 4] = ["java.", "javax.", "jdk.", "sun."];

/// Engine settings. Command-line flags override the environment, which
/// overrides these defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// `None` means the default location under the user's data directory.
    pub cache_path: Option<PathBuf>,
    /// Never read or write the persistent store.
    pub disabled: bool,
    /// Read the store but never write to it.
    pub read_only: bool,
    /// Trust any stored index for a container without comparing identities.
    pub always_valid: bool,
    pub identity_policy: IdentityPolicy,
    pub scan_threads: usize,
    pub log_queries: bool,
    /// Package prefixes assumed to name platform types in strict queries.
    pub platform_allow_list: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_path: None,
            disabled: false,
            read_only: false,
            always_valid: false,
            identity_policy: IdentityPolicy::default(),
            scan_threads: default_threads(),
            log_queries: false,
            platform_allow_list: DEFAULT_PLATFORM_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl EngineOptions {
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|key| env::var(key).ok())
    }

    /// Applies `ANNOCACHE_*` variables looked up through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(p) = lookup(ENV_DB).filter(|p| !p.trim().is_empty()) {
            self.cache_path = Some(PathBuf::from(p));
        }
        if let Some(v) = lookup(ENV_DISABLED) {
            self.disabled = parse_bool(ENV_DISABLED, &v)?;
        }
        if let Some(v) = lookup(ENV_READ_ONLY) {
            self.read_only = parse_bool(ENV_READ_ONLY, &v)?;
        }
        if let Some(v) = lookup(ENV_ALWAYS_VALID) {
            self.always_valid = parse_bool(ENV_ALWAYS_VALID, &v)?;
        }
        if let Some(v) = lookup(ENV_DIGEST) {
            self.identity_policy = if parse_bool(ENV_DIGEST, &v)? {
                IdentityPolicy::ContentDigest
            } else {
                IdentityPolicy::TimestampSize
            };
        }
        if let Some(v) = lookup(ENV_THREADS) {
            self.scan_threads = v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid {ENV_THREADS} value: {v}"))?
                .max(1);
        }
        if let Some(v) = lookup(ENV_LOG_QUERIES) {
            self.log_queries = parse_bool(ENV_LOG_QUERIES, &v)?;
        }
        Ok(self)
    }

    pub fn resolve_cache_path(&self) -> Result<PathBuf> {
        if let Some(p) = self.cache_path.clone() {
            return Ok(p);
        }
        Ok(annocache_home()?.join("cache.lmdb"))
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("Invalid boolean for {key}: {other}"),
    }
}

/// Removes the LMDB store and its lock file.
pub fn clear_db(db_path: &Path) -> Result<()> {
    if db_path.is_dir() {
        std::fs::remove_dir_all(db_path)
            .with_context(|| format!("Failed to remove cache directory: {}", db_path.display()))?;
        return Ok(());
    }
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "db lock")?;
    Ok(())
}

fn annocache_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("annocache"))
}

fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
