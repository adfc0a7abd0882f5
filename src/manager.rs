//! Per-container cache manager.
//!
//! For each container the manager resolves the current identity, reuses the
//! published in-memory index or the stored blob when the identity still
//! matches, and otherwise decodes every class entry and writes the new index
//! back through [`CacheStore::put_atomic`]. At most one rebuild per container
//! key runs at a time; concurrent callers wait for it and share its result.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::classfile::decode;
use crate::codec;
use crate::container::{ContainerLocation, ContainerProvider};
use crate::error::{DecodeError, ScanError, ScanResult, StoreError};
use crate::events::{MissReason, ScanEvents};
use crate::identity::{self, ContainerIdentity, IdentityPolicy};
use crate::index::PerContainerIndex;
use crate::store::CacheStore;

/// Shared flag that abandons in-progress scans.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerSettings {
    pub disabled: bool,
    pub always_valid: bool,
    pub identity_policy: IdentityPolicy,
}

type BuildCell = Arc<OnceLock<ScanResult<Arc<PerContainerIndex>>>>;

pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    provider: Arc<dyn ContainerProvider>,
    events: Arc<dyn ScanEvents>,
    settings: ManagerSettings,
    published: RwLock<HashMap<String, Arc<PerContainerIndex>>>,
    in_flight: Mutex<HashMap<String, BuildCell>>,
    forced: Mutex<HashSet<String>>,
    decode_calls: AtomicU64,
    decode_passes: AtomicU64,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        provider: Arc<dyn ContainerProvider>,
        events: Arc<dyn ScanEvents>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            settings,
            published: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            forced: Mutex::new(HashSet::new()),
            decode_calls: AtomicU64::new(0),
            decode_passes: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn ContainerProvider> {
        &self.provider
    }

    /// Class files handed to the decoder so far.
    pub fn decode_calls(&self) -> u64 {
        self.decode_calls.load(Ordering::SeqCst)
    }

    /// Containers rebuilt from their class files so far.
    pub fn decode_passes(&self) -> u64 {
        self.decode_passes.load(Ordering::SeqCst)
    }

    pub fn published_len(&self) -> usize {
        self.published.read().len()
    }

    pub fn resolve_identity(&self, location: &ContainerLocation) -> ScanResult<ContainerIdentity> {
        identity::resolve(self.provider.as_ref(), location, self.settings.identity_policy)
    }

    /// Returns the index for `location`, loading or rebuilding it as needed.
    pub fn load(
        &self,
        location: &ContainerLocation,
        cancel: &CancelToken,
    ) -> ScanResult<Arc<PerContainerIndex>> {
        let key = identity::cache_key(location);
        let current = self.resolve_identity(location)?;

        if !self.forced.lock().contains(&key) {
            if let Some(index) = self.published_hit(&key, &current) {
                self.events.cache_hit(&current.path, false);
                return Ok(index);
            }
        }

        loop {
            let cell = self
                .in_flight
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone();
            let result = cell
                .get_or_init(|| self.load_uncached(&key, location, &current, cancel))
                .clone();

            {
                let mut in_flight = self.in_flight.lock();
                if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                    in_flight.remove(&key);
                }
            }

            // A build abandoned by another caller's token says nothing about
            // this caller; start a fresh one under our own token.
            if matches!(result, Err(ScanError::Cancelled { .. })) && !cancel.is_cancelled() {
                continue;
            }
            return result;
        }
    }

    /// Drops the published index without touching the store.
    pub fn evict(&self, location: &ContainerLocation) -> bool {
        let key = identity::cache_key(location);
        self.published.write().remove(&key).is_some()
    }

    /// Evicts, deletes the stored entry and forces the next load to rebuild
    /// even if the identity is unchanged.
    pub fn invalidate(&self, location: &ContainerLocation) -> Result<(), StoreError> {
        let key = identity::cache_key(location);
        self.forced.lock().insert(key.clone());
        self.published.write().remove(&key);
        self.events.invalidated(&location.logical_path());
        if self.settings.disabled {
            return Ok(());
        }
        match self.store.delete(&key) {
            Ok(_) | Err(StoreError::ReadOnly) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn published_hit(&self, key: &str, current: &ContainerIdentity) -> Option<Arc<PerContainerIndex>> {
        let published = self.published.read();
        let index = published.get(key)?;
        self.accepts(&index.identity, current).then(|| Arc::clone(index))
    }

    fn accepts(&self, stored: &ContainerIdentity, current: &ContainerIdentity) -> bool {
        if self.settings.always_valid {
            return stored.path == current.path;
        }
        identity::is_valid(stored, current)
    }

    fn load_uncached(
        &self,
        key: &str,
        location: &ContainerLocation,
        current: &ContainerIdentity,
        cancel: &CancelToken,
    ) -> ScanResult<Arc<PerContainerIndex>> {
        let forced = self.forced.lock().remove(key);
        if !forced {
            // Another caller may have published between our check and the
            // in-flight registration.
            if let Some(index) = self.published_hit(key, current) {
                self.events.cache_hit(&current.path, false);
                return Ok(index);
            }
        }

        let reason = if self.settings.disabled {
            MissReason::Disabled
        } else if forced {
            MissReason::Forced
        } else {
            match self.read_stored(key) {
                Ok(Some(stored)) if self.accepts(&stored.identity, current) => {
                    self.events.cache_hit(&current.path, true);
                    return Ok(self.publish(key, stored));
                }
                Ok(Some(_)) => MissReason::Stale,
                Ok(None) => MissReason::Absent,
                Err(e) => {
                    self.events.cache_corrupt(&current.path, &e.to_string());
                    MissReason::Corrupt
                }
            }
        };
        self.events.cache_miss(&current.path, reason);

        let index = match self.rebuild(location, current.clone(), cancel) {
            Ok(index) => index,
            Err(e) => {
                if forced {
                    self.forced.lock().insert(key.to_string());
                }
                return Err(e);
            }
        };
        if !self.settings.disabled {
            self.persist(key, &index);
        }
        Ok(self.publish(key, index))
    }

    fn read_stored(&self, key: &str) -> ScanResult<Option<PerContainerIndex>> {
        let corrupt = |reason: String| ScanError::CacheCorrupt {
            key: key.to_string(),
            reason,
        };
        let Some(bytes) = self.store.get(key).map_err(|e| corrupt(e.to_string()))? else {
            return Ok(None);
        };
        codec::decode(&bytes)
            .map(Some)
            .map_err(|e| corrupt(e.to_string()))
    }

    fn rebuild(
        &self,
        location: &ContainerLocation,
        identity: ContainerIdentity,
        cancel: &CancelToken,
    ) -> ScanResult<PerContainerIndex> {
        self.decode_passes.fetch_add(1, Ordering::SeqCst);
        let path = identity.path.clone();
        let mut index = PerContainerIndex::new(identity);
        let mut cancelled = false;

        self.provider.for_each_class(location, &mut |entry| {
            if cancel.is_cancelled() {
                cancelled = true;
                return ControlFlow::Break(());
            }
            self.decode_calls.fetch_add(1, Ordering::SeqCst);
            match decode(&entry.bytes) {
                Ok(record) => index.insert(&entry.name, record),
                Err(DecodeError::IncompleteClass { partial, reason }) => {
                    self.events.class_failed(&path, &entry.name, &reason);
                    index.record_failure(&entry.name, reason);
                    index.insert(&entry.name, *partial);
                }
                Err(e) => {
                    self.events.class_failed(&path, &entry.name, e.reason());
                    index.record_failure(&entry.name, e.reason());
                }
            }
            ControlFlow::Continue(())
        })?;

        if cancelled || cancel.is_cancelled() {
            return Err(ScanError::Cancelled { path });
        }
        if index.incomplete {
            self.events
                .partial_scan(&path, index.failures.len(), index.classes.len());
        }
        Ok(index)
    }

    fn persist(&self, key: &str, index: &PerContainerIndex) {
        let path = &index.identity.path;
        let bytes = match codec::encode(index) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.events.cache_write_failed(path, &e.to_string());
                return;
            }
        };
        match self.store.put_atomic(key, &bytes) {
            Ok(()) => self.events.cache_written(path, bytes.len()),
            Err(StoreError::ReadOnly) => {}
            Err(e) => self.events.cache_write_failed(path, &e.to_string()),
        }
    }

    fn publish(&self, key: &str, index: PerContainerIndex) -> Arc<PerContainerIndex> {
        let index = Arc::new(index);
        self.published
            .write()
            .insert(key.to_string(), Arc::clone(&index));
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassFileBuilder;
    use crate::container::{ClassEntry, ContainerStat};
    use crate::events::{EventCounters, NoopEvents};
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    /// In-memory provider whose containers can be edited between loads.
    #[derive(Default)]
    struct FakeProvider {
        containers: RwLock<HashMap<String, (ContainerStat, Vec<(String, Vec<u8>)>)>>,
    }

    impl FakeProvider {
        fn set(&self, path: &str, mtime: u64, classes: Vec<(String, Vec<u8>)>) {
            let size = classes.iter().map(|(_, b)| b.len() as u64).sum();
            self.containers.write().insert(
                path.to_string(),
                (
                    ContainerStat {
                        size,
                        last_modified: mtime,
                    },
                    classes,
                ),
            );
        }
    }

    impl ContainerProvider for FakeProvider {
        fn stat(&self, container: &ContainerLocation) -> ScanResult<ContainerStat> {
            self.containers
                .read()
                .get(&container.logical_path())
                .map(|(stat, _)| *stat)
                .ok_or_else(|| ScanError::unreadable(container.logical_path(), "missing"))
        }

        fn for_each_class(
            &self,
            container: &ContainerLocation,
            visit: &mut dyn FnMut(ClassEntry) -> ControlFlow<()>,
        ) -> ScanResult<()> {
            let classes = self
                .containers
                .read()
                .get(&container.logical_path())
                .map(|(_, c)| c.clone())
                .ok_or_else(|| ScanError::unreadable(container.logical_path(), "missing"))?;
            for (name, bytes) in classes {
                if visit(ClassEntry { name, bytes }).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn class(name: &str) -> (String, Vec<u8>) {
        (
            format!("{}.class", name.replace('.', "/")),
            ClassFileBuilder::new(name).build(),
        )
    }

    fn jar(path: &str) -> ContainerLocation {
        ContainerLocation::Archive(PathBuf::from(path))
    }

    fn manager(
        provider: Arc<FakeProvider>,
        store: Arc<MemoryStore>,
        events: Arc<dyn ScanEvents>,
    ) -> CacheManager {
        CacheManager::new(store, provider, events, ManagerSettings::default())
    }

    #[test]
    fn second_load_reuses_published_index() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A"), class("a.B")]);
        let store = Arc::new(MemoryStore::new());
        let m = manager(provider, store.clone(), Arc::new(NoopEvents));

        let first = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        let second = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(m.decode_calls(), 2);
        assert_eq!(m.decode_passes(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn stored_index_is_used_by_a_fresh_manager() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let store = Arc::new(MemoryStore::new());

        let first = manager(provider.clone(), store.clone(), Arc::new(NoopEvents));
        let built = first.load(&jar("/a.jar"), &CancelToken::new()).unwrap();

        let counters = Arc::new(EventCounters::new());
        let second = manager(provider, store, counters.clone());
        let loaded = second.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert_eq!(*loaded, *built);
        assert_eq!(second.decode_calls(), 0);
        assert_eq!(EventCounters::get(&counters.store_hits), 1);
    }

    #[test]
    fn changed_identity_forces_rebuild() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let m = manager(provider.clone(), Arc::new(MemoryStore::new()), Arc::new(NoopEvents));

        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        provider.set("/a.jar", 2, vec![class("a.A"), class("a.C")]);
        let rebuilt = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(rebuilt.contains("a.C"));
        assert_eq!(m.decode_passes(), 2);
    }

    #[test]
    fn always_valid_trusts_stale_entries() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let settings = ManagerSettings {
            always_valid: true,
            ..ManagerSettings::default()
        };
        let m = CacheManager::new(
            Arc::new(MemoryStore::new()),
            provider.clone(),
            Arc::new(NoopEvents),
            settings,
        );
        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        provider.set("/a.jar", 9, vec![class("a.A"), class("a.C")]);
        let index = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(!index.contains("a.C"));
        assert_eq!(m.decode_passes(), 1);
    }

    #[test]
    fn corrupt_blob_is_a_miss() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(&identity::cache_key(&jar("/a.jar")), vec![1, 2, 3]);
        let counters = Arc::new(EventCounters::new());
        let m = manager(provider, store.clone(), counters.clone());

        let index = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(index.contains("a.A"));
        assert_eq!(EventCounters::get(&counters.corrupt), 1);
        let repaired = store.get(&identity::cache_key(&jar("/a.jar"))).unwrap().unwrap();
        assert!(codec::decode(&repaired).is_ok());
    }

    #[test]
    fn write_failure_still_returns_index() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let counters = Arc::new(EventCounters::new());
        let m = manager(provider, store.clone(), counters.clone());

        let index = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(index.contains("a.A"));
        assert_eq!(EventCounters::get(&counters.write_failures), 1);
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn invalidate_forces_rebuild_with_unchanged_identity() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let store = Arc::new(MemoryStore::new());
        let m = manager(provider, store.clone(), Arc::new(NoopEvents));

        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        m.invalidate(&jar("/a.jar")).unwrap();
        assert_eq!(store.len().unwrap(), 0);
        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert_eq!(m.decode_passes(), 2);
        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert_eq!(m.decode_passes(), 2);
    }

    #[test]
    fn cancelled_scan_publishes_nothing() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let store = Arc::new(MemoryStore::new());
        let m = manager(provider, store.clone(), Arc::new(NoopEvents));

        let token = CancelToken::new();
        token.cancel();
        let err = m.load(&jar("/a.jar"), &token).unwrap_err();
        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(m.published_len(), 0);

        m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    /// Holds the first scan open until the test releases it.
    struct GatedProvider {
        inner: FakeProvider,
        started: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl ContainerProvider for GatedProvider {
        fn stat(&self, container: &ContainerLocation) -> ScanResult<ContainerStat> {
            self.inner.stat(container)
        }

        fn for_each_class(
            &self,
            container: &ContainerLocation,
            visit: &mut dyn FnMut(ClassEntry) -> ControlFlow<()>,
        ) -> ScanResult<()> {
            if let Some(started) = self.started.lock().take() {
                let _ = started.send(());
                let release = self.release.lock().take();
                if let Some(release) = release {
                    let _ = release.recv();
                }
            }
            self.inner.for_each_class(container, visit)
        }
    }

    #[test]
    fn cancelling_one_caller_does_not_fail_a_waiting_one() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let provider = Arc::new(GatedProvider {
            inner: FakeProvider::default(),
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(Some(release_rx)),
        });
        provider.inner.set("/a.jar", 1, vec![class("a.A")]);
        let m = Arc::new(CacheManager::new(
            Arc::new(MemoryStore::new()),
            provider,
            Arc::new(NoopEvents),
            ManagerSettings::default(),
        ));

        let undeployed = CancelToken::new();
        let first = {
            let m = Arc::clone(&m);
            let token = undeployed.clone();
            std::thread::spawn(move || m.load(&jar("/a.jar"), &token))
        };
        started_rx.recv().unwrap();

        let second = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.load(&jar("/a.jar"), &CancelToken::new()))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        undeployed.cancel();
        release_tx.send(()).unwrap();

        assert!(matches!(
            first.join().unwrap(),
            Err(ScanError::Cancelled { .. })
        ));
        let index = second.join().unwrap().unwrap();
        assert!(index.contains("a.A"));
        assert_eq!(m.published_len(), 1);
        assert_eq!(m.decode_passes(), 2);
    }

    #[test]
    fn unreadable_container_propagates() {
        let m = manager(
            Arc::new(FakeProvider::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopEvents),
        );
        assert!(matches!(
            m.load(&jar("/missing.jar"), &CancelToken::new()),
            Err(ScanError::ContainerUnreadable { .. })
        ));
    }

    #[test]
    fn malformed_entries_are_dropped_and_partials_kept() {
        let provider = Arc::new(FakeProvider::default());
        let mut truncated = ClassFileBuilder::new("a.Partial")
            .field("f", "I", Vec::new())
            .build();
        truncated.truncate(truncated.len() - 3);
        provider.set(
            "/a.jar",
            1,
            vec![
                class("a.A"),
                ("a/Bad.class".to_string(), vec![0xDE, 0xAD]),
                ("a/Partial.class".to_string(), truncated),
            ],
        );
        let m = manager(provider, Arc::new(MemoryStore::new()), Arc::new(NoopEvents));
        let index = m.load(&jar("/a.jar"), &CancelToken::new()).unwrap();
        assert!(index.incomplete);
        assert!(index.contains("a.A"));
        assert!(!index.contains("a.Bad"));
        assert!(index.get("a.Partial").is_some_and(|r| r.partial));
        assert_eq!(index.failures.len(), 2);
    }

    #[test]
    fn concurrent_loads_share_one_build() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("/a.jar", 1, vec![class("a.A")]);
        let m = Arc::new(manager(
            provider,
            Arc::new(MemoryStore::new()),
            Arc::new(NoopEvents),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || m.load(&jar("/a.jar"), &CancelToken::new()).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(m.decode_calls(), 1);
        assert_eq!(m.decode_passes(), 1);
    }
}
