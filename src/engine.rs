//! Engine facade: opens modules, runs queries and manages container
//! lifecycles on top of the cache manager.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EngineOptions;
use crate::container::{ContainerLocation, ContainerProvider, ContainerSpec, FsContainerProvider};
use crate::error::{ScanResult, StoreError};
use crate::events::{CountingEvents, EventCounters, ScanEvents, TracingEvents};
use crate::index::PerContainerIndex;
use crate::manager::{CacheManager, CancelToken, ManagerSettings};
use crate::query::{self, QueryOptions};
use crate::record::AnnotationUsage;
use crate::store::{CacheStore, DirStore, LmdbStore, MemoryStore, ReadOnlyStore};
use crate::view::{ContainerTable, ModuleView};

pub struct AnnotationEngine {
    options: EngineOptions,
    manager: CacheManager,
    events: Arc<CountingEvents>,
    pool: ThreadPool,
    modules: Mutex<HashMap<String, ModuleRecord>>,
}

struct ModuleRecord {
    table: ContainerTable,
    containers: Vec<ContainerLocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub store: String,
    pub stored_indexes: u64,
    pub published_indexes: usize,
    pub decode_calls: u64,
    pub decode_passes: u64,
    pub cache_hits: u64,
    pub store_hits: u64,
    pub cache_misses: u64,
    pub corrupt_entries: u64,
    pub class_failures: u64,
    pub partial_scans: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub invalidations: u64,
    pub queries: u64,
}

impl AnnotationEngine {
    /// Engine over the local file system with the store named by `options`:
    /// LMDB at the resolved cache path, or an in-memory store when caching
    /// is disabled.
    pub fn open(options: EngineOptions) -> Result<Self> {
        let store: Arc<dyn CacheStore> = if options.disabled {
            Arc::new(MemoryStore::new())
        } else {
            let path = options.resolve_cache_path()?;
            open_store(&path)
                .with_context(|| format!("Failed to open cache store: {}", path.display()))?
        };
        let events = Arc::new(TracingEvents::new(options.log_queries));
        Self::with_parts(options, store, Arc::new(FsContainerProvider::new()), events)
    }

    pub fn with_parts(
        options: EngineOptions,
        store: Arc<dyn CacheStore>,
        provider: Arc<dyn ContainerProvider>,
        events: Arc<dyn ScanEvents>,
    ) -> Result<Self> {
        let store: Arc<dyn CacheStore> = if options.read_only {
            Arc::new(ReadOnlyStore::new(store))
        } else {
            store
        };
        let events = Arc::new(CountingEvents::new(events));
        let settings = ManagerSettings {
            disabled: options.disabled,
            always_valid: options.always_valid,
            identity_policy: options.identity_policy,
        };
        let manager = CacheManager::new(store, provider, events.clone(), settings);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.scan_threads.max(1))
            .thread_name(|i| format!("annocache-scan-{i}"))
            .build()
            .context("Failed to build scan thread pool")?;

        Ok(Self {
            options,
            manager,
            events,
            pool,
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Default query options carrying the configured platform allow-list.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            platform_allow_list: self.options.platform_allow_list.clone(),
            ..QueryOptions::default()
        }
    }

    pub fn open_module(&self, containers: &[ContainerSpec]) -> ScanResult<ModuleView> {
        self.open_module_with(containers, &CancelToken::new())
    }

    /// Loads every container on the scan pool and merges them in order. The
    /// first container (in list order) that fails to load fails the module.
    pub fn open_module_with(
        &self,
        containers: &[ContainerSpec],
        cancel: &CancelToken,
    ) -> ScanResult<ModuleView> {
        let loaded: Vec<ScanResult<Arc<PerContainerIndex>>> = self.pool.install(|| {
            containers
                .par_iter()
                .map(|spec| self.manager.load(&spec.location, cancel))
                .collect()
        });

        let mut merged = Vec::with_capacity(containers.len());
        for (spec, index) in containers.iter().zip(loaded) {
            merged.push((spec.clone(), index?));
        }
        let view = ModuleView::build(merged);
        debug!(
            containers = view.containers().len(),
            classes = view.len(),
            shadowed = view.shadowed().len(),
            "module view built"
        );
        Ok(view)
    }

    /// Opens a module under a name so later opens can report what changed
    /// and [`release`](Self::release) can evict its containers.
    pub fn open_named(
        &self,
        module: &str,
        containers: &[ContainerSpec],
        cancel: &CancelToken,
    ) -> ScanResult<ModuleView> {
        let view = self.open_module_with(containers, cancel)?;
        let table = view.container_table();
        let mut modules = self.modules.lock();
        if let Some(previous) = modules.get(module) {
            match previous.table.diff(&table) {
                Some(change) => info!(module, %change, "module containers changed"),
                None => debug!(module, "module containers unchanged"),
            }
        }
        modules.insert(
            module.to_string(),
            ModuleRecord {
                table,
                containers: containers.iter().map(|c| c.location.clone()).collect(),
            },
        );
        Ok(view)
    }

    /// Forgets a named module and evicts containers no other open module
    /// still uses. Stored indexes are kept.
    pub fn release(&self, module: &str) -> usize {
        let mut modules = self.modules.lock();
        let Some(record) = modules.remove(module) else {
            return 0;
        };
        let mut evicted = 0;
        for location in &record.containers {
            let shared = modules.values().any(|m| m.containers.contains(location));
            if !shared && self.manager.evict(location) {
                evicted += 1;
            }
        }
        info!(module, evicted, "module released");
        evicted
    }

    pub fn evict(&self, container: &ContainerLocation) -> bool {
        self.manager.evict(container)
    }

    /// Forces the next open touching `container` to rebuild its index.
    pub fn invalidate(&self, container: &ContainerLocation) -> Result<(), StoreError> {
        self.manager.invalidate(container)
    }

    pub fn clear_store(&self) -> Result<(), StoreError> {
        self.manager.store().clear()
    }

    pub fn decode_calls(&self) -> u64 {
        self.manager.decode_calls()
    }

    pub fn decode_passes(&self) -> u64 {
        self.manager.decode_passes()
    }

    pub fn counters(&self) -> &EventCounters {
        self.events.counters()
    }

    pub fn stats(&self) -> Result<EngineStats, StoreError> {
        let c = self.counters();
        Ok(EngineStats {
            store: self.manager.store().describe(),
            stored_indexes: self.manager.store().len()?,
            published_indexes: self.manager.published_len(),
            decode_calls: self.decode_calls(),
            decode_passes: self.decode_passes(),
            cache_hits: EventCounters::get(&c.hits),
            store_hits: EventCounters::get(&c.store_hits),
            cache_misses: EventCounters::get(&c.misses),
            corrupt_entries: EventCounters::get(&c.corrupt),
            class_failures: EventCounters::get(&c.class_failures),
            partial_scans: EventCounters::get(&c.partial_scans),
            writes: EventCounters::get(&c.writes),
            write_failures: EventCounters::get(&c.write_failures),
            invalidations: EventCounters::get(&c.invalidations),
            queries: EventCounters::get(&c.queries),
        })
    }

    pub fn classes_with_annotation(
        &self,
        view: &ModuleView,
        annotation: &str,
        include_inherited: bool,
        options: &QueryOptions,
    ) -> ScanResult<Vec<String>> {
        let found = query::classes_with_annotation(view, annotation, include_inherited, options)?;
        self.events.query("annotated", annotation, found.len());
        Ok(found)
    }

    pub fn classes_assignable_to(
        &self,
        view: &ModuleView,
        type_name: &str,
        options: &QueryOptions,
    ) -> ScanResult<Vec<String>> {
        let found = query::classes_assignable_to(view, type_name, options)?;
        self.events.query("assignable", type_name, found.len());
        Ok(found)
    }

    pub fn classes_in_package(
        &self,
        view: &ModuleView,
        package: &str,
        options: &QueryOptions,
    ) -> Vec<String> {
        let found = query::classes_in_package(view, package, options);
        self.events.query("package", package, found.len());
        found
    }

    pub fn classes_with_field_annotation(
        &self,
        view: &ModuleView,
        annotation: &str,
        options: &QueryOptions,
    ) -> ScanResult<Vec<String>> {
        let found = query::classes_with_field_annotation(view, annotation, options)?;
        self.events.query("field-annotated", annotation, found.len());
        Ok(found)
    }

    pub fn classes_with_method_annotation(
        &self,
        view: &ModuleView,
        annotation: &str,
        options: &QueryOptions,
    ) -> ScanResult<Vec<String>> {
        let found = query::classes_with_method_annotation(view, annotation, options)?;
        self.events.query("method-annotated", annotation, found.len());
        Ok(found)
    }

    pub fn annotations_on(
        &self,
        view: &ModuleView,
        class_name: &str,
        options: &QueryOptions,
    ) -> ScanResult<Vec<AnnotationUsage>> {
        let found = query::annotations_on(view, class_name, options)?;
        self.events.query("annotations-on", class_name, found.len());
        Ok(found)
    }
}

/// An existing directory at the cache path holds one file per index;
/// anything else is an LMDB environment file.
fn open_store(path: &Path) -> Result<Arc<dyn CacheStore>, StoreError> {
    if path.is_dir() {
        Ok(Arc::new(DirStore::open(path.to_path_buf())?))
    } else {
        Ok(Arc::new(LmdbStore::open(path.to_path_buf())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;

    fn engine(options: EngineOptions) -> AnnotationEngine {
        AnnotationEngine::with_parts(
            options,
            Arc::new(MemoryStore::new()),
            Arc::new(FsContainerProvider::new()),
            Arc::new(NoopEvents),
        )
        .unwrap()
    }

    #[test]
    fn query_options_carry_platform_list() {
        let mut options = EngineOptions {
            scan_threads: 1,
            ..EngineOptions::default()
        };
        options.platform_allow_list = vec!["lib.".to_string()];
        let engine = engine(options);
        let q = engine.query_options();
        assert!(q.is_platform("lib.Thing"));
        assert!(!q.is_platform("java.lang.Object"));
        assert!(!q.strict);
    }

    #[test]
    fn empty_module_opens_and_reports_stats() {
        let engine = engine(EngineOptions {
            scan_threads: 2,
            ..EngineOptions::default()
        });
        let view = engine.open_module(&[]).unwrap();
        assert!(view.is_empty());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.store, "memory");
        assert_eq!(stats.decode_calls, 0);
    }

    #[test]
    fn read_only_engine_rejects_clear() {
        let engine = engine(EngineOptions {
            read_only: true,
            scan_threads: 1,
            ..EngineOptions::default()
        });
        assert!(matches!(engine.clear_store(), Err(StoreError::ReadOnly)));
        assert!(engine.stats().unwrap().store.ends_with("(read-only)"));
    }

    #[test]
    fn release_unknown_module_is_noop() {
        let engine = engine(EngineOptions {
            scan_threads: 1,
            ..EngineOptions::default()
        });
        assert_eq!(engine.release("missing"), 0);
    }

    #[test]
    fn directory_cache_path_selects_file_per_index_store() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "annocache_engine_{}_{}_dirstore",
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&root).unwrap();

        let engine = AnnotationEngine::open(EngineOptions {
            cache_path: Some(root.clone()),
            scan_threads: 1,
            ..EngineOptions::default()
        })
        .unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.store, format!("dir:{}", root.display()));
        assert_eq!(stats.stored_indexes, 0);
        drop(engine);

        let _ = std::fs::remove_dir_all(root);
    }
}
