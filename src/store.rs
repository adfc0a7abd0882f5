//! Persistent byte stores for encoded container indexes.
//!
//! Writers never leave a half-written value under a live key: every backend
//! stages the new value first and then replaces the old one in a single
//! atomic step (an LMDB transaction or a file rename).

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

use crate::error::StoreError;

pub const INDEXES_DB: &str = "indexes";
pub const STAGING_DB: &str = "staging";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the value under `key` so that readers see either the old
    /// value or the new one, never a mix.
    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a value was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn len(&self) -> Result<u64, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Human-readable location for logs and `stats`.
    fn describe(&self) -> String;
}

type BlobDb = Database<Str, Bytes>;

/// LMDB-backed store. One environment file holds every index.
#[derive(Debug)]
pub struct LmdbStore {
    env: Arc<Env>,
    db_path: PathBuf,
    indexes: BlobDb,
    staging: BlobDb,
}

impl LmdbStore {
    pub fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let env = Arc::new(open_env(&db_path)?);

        let mut wtxn = env.write_txn()?;
        let indexes = env.create_database::<Str, Bytes>(&mut wtxn, Some(INDEXES_DB))?;
        let staging = env.create_database::<Str, Bytes>(&mut wtxn, Some(STAGING_DB))?;
        wtxn.commit()?;

        let store = Self {
            env,
            db_path,
            indexes,
            staging,
        };
        let leftover = store.staged_len()?;
        if leftover > 0 {
            warn!(db = %store.db_path.display(), leftover, "discarding staged values from an interrupted write");
            let mut wtxn = store.env.write_txn()?;
            store.staging.clear(&mut wtxn)?;
            wtxn.commit()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Staged values left behind by an interrupted writer.
    pub fn staged_len(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.staging.len(&rtxn)?)
    }
}

impl CacheStore for LmdbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.indexes.get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.staging.put(&mut wtxn, key, bytes)?;
        wtxn.commit()?;

        let mut wtxn = self.env.write_txn()?;
        let staged = self
            .staging
            .get(&wtxn, key)?
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StoreError::Backend(format!("staged value for {key} vanished")))?;
        self.indexes.put(&mut wtxn, key, &staged)?;
        self.staging.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.indexes.delete(&mut wtxn, key)?;
        self.staging.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(existed)
    }

    fn len(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.indexes.len(&rtxn)?)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.indexes.clear(&mut wtxn)?;
        self.staging.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("lmdb:{}", self.db_path.display())
    }
}

fn open_env(db_path: &Path) -> Result<Env, StoreError> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the store at the single path given by --db.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        Ok(options.open(db_path)?)
    }
}

/// One file per index under a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.bin"))
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.tmp"))
    }

    fn blob_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "bin" || e == "tmp")
            {
                out.push(path);
            }
        }
        Ok(out)
    }
}

impl CacheStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.staging_path(key);
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, self.blob_path(key)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _ = std::fs::remove_file(self.staging_path(key));
        match std::fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self
            .blob_files()?
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "bin"))
            .count() as u64)
    }

    fn clear(&self) -> Result<(), StoreError> {
        for path in self.blob_files()? {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

/// In-process store, used when caching is disabled and by tests. Writes can
/// be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful `put_atomic` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrites a value without any checks, e.g. to plant a corrupt blob.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.entries.write().insert(key.to_string(), bytes);
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write failure injected".to_string()));
        }
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self.entries.read().len() as u64)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Read-through view of another store that rejects every write.
pub struct ReadOnlyStore {
    inner: Arc<dyn CacheStore>,
}

impl ReadOnlyStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self { inner }
    }
}

impl CacheStore for ReadOnlyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn put_atomic(&self, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn len(&self) -> Result<u64, StoreError> {
        self.inner.len()
    }

    fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn describe(&self) -> String {
        format!("{} (read-only)", self.inner.describe())
    }
}
