//! Process-wide table of open graphs.
//!
//! A graph is a fact store over its own page cache and backing store plus
//! the transaction queue that serializes its writes. At most one graph per
//! name is open. The table lock is only held to read or swap a slot; opening
//! and removing happen outside it behind a per-name busy slot, so one
//! graph's slow open or drain never stalls lookups of another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;

use factd_core::{FactStore, PageStorage, StoreStats};

use crate::error::{SidecarError, SidecarResult};
use crate::events::{Event, EventBus};
use crate::protocol::GraphOptions;
use crate::queue::{QueueStats, TxQueue};
use crate::storage::{
    BackingStore, CacheConfig, CacheStats, CachedStorage, MemoryBackingStore, RocksBackingStore,
    StoreConfig,
};

/// Progress of the current resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Batches applied since the last `full` batch
    pub batches: u64,
    /// Facts applied since the last `full` batch
    pub facts: u64,
    /// Every sync batch applied since the graph was opened
    pub total_batches: u64,
}

#[derive(Default)]
struct SyncCounters {
    batches: AtomicU64,
    facts: AtomicU64,
    total_batches: AtomicU64,
}

/// Everything `graph-stats` reports.
#[derive(Debug, Clone)]
pub struct GraphStats {
    pub name: String,
    pub path: Option<PathBuf>,
    pub store: StoreStats,
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub sync: SyncProgress,
    pub stored_pages: usize,
    pub uptime_secs: u64,
}

/// One open graph.
pub struct Graph {
    name: String,
    path: Option<PathBuf>,
    store: Arc<FactStore>,
    storage: Arc<CachedStorage>,
    queue: TxQueue,
    sync: SyncCounters,
    opened_at: Instant,
}

impl Graph {
    /// Open the backing store and fact store. Blocking.
    fn open(name: &str, opts: GraphOptions, default_cache: CacheConfig) -> SidecarResult<Self> {
        let backing: Arc<dyn BackingStore> = match &opts.path {
            Some(path) => Arc::new(RocksBackingStore::open(StoreConfig::new(path))?),
            None => Arc::new(MemoryBackingStore::new()),
        };
        Self::with_backing(name, opts, backing, default_cache)
    }

    fn with_backing(
        name: &str,
        opts: GraphOptions,
        backing: Arc<dyn BackingStore>,
        default_cache: CacheConfig,
    ) -> SidecarResult<Self> {
        let storage = Arc::new(CachedStorage::new(
            backing,
            opts.cache.unwrap_or(default_cache),
        ));
        let page_storage: Arc<dyn PageStorage> = storage.clone();
        let store = FactStore::open(page_storage, opts.schema)?;
        Ok(Self {
            name: name.to_string(),
            path: opts.path,
            store: Arc::new(store),
            storage,
            queue: TxQueue::new(name),
            sync: SyncCounters::default(),
            opened_at: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<CachedStorage> {
        &self.storage
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    /// Run a read against the current snapshot on the blocking pool.
    ///
    /// Reads bypass the queue; page restores may block on disk.
    pub async fn read<F, T>(&self, f: F) -> SidecarResult<T>
    where
        F: FnOnce(&FactStore) -> SidecarResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Queue a write. The job runs after every write submitted before it.
    pub fn write<F, T>(
        &self,
        f: F,
    ) -> impl std::future::Future<Output = SidecarResult<T>> + Send + 'static
    where
        F: FnOnce(&FactStore) -> SidecarResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        self.queue.submit(move || f(&store))
    }

    pub(crate) fn record_sync(&self, facts: usize, full: bool) {
        if full {
            self.sync.batches.store(0, Ordering::SeqCst);
            self.sync.facts.store(0, Ordering::SeqCst);
        }
        self.sync.batches.fetch_add(1, Ordering::SeqCst);
        self.sync.facts.fetch_add(facts as u64, Ordering::SeqCst);
        self.sync.total_batches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sync_progress(&self) -> SyncProgress {
        SyncProgress {
            batches: self.sync.batches.load(Ordering::SeqCst),
            facts: self.sync.facts.load(Ordering::SeqCst),
            total_batches: self.sync.total_batches.load(Ordering::SeqCst),
        }
    }

    /// Blocking: lists every stored page.
    pub fn stats(&self) -> SidecarResult<GraphStats> {
        Ok(GraphStats {
            name: self.name.clone(),
            path: self.path.clone(),
            store: self.store.stats(),
            cache: self.storage.stats(),
            queue: self.queue.stats(),
            sync: self.sync_progress(),
            stored_pages: self.storage.list_addresses().map_err(factd_core::CoreError::from)?.len(),
            uptime_secs: self.opened_at.elapsed().as_secs(),
        })
    }

    /// Drain queued writes and flush to the backing store.
    async fn drain(&self) -> SidecarResult<()> {
        self.queue.close().await;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.flush()).await??;
        Ok(())
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Cache budgets for graphs opened without their own
    pub default_cache: CacheConfig,
    /// Directory for graphs opened with a relative path
    pub data_dir: Option<PathBuf>,
}

enum Slot {
    Open(Arc<Graph>),
    /// Being opened or removed. Resolves when the sender drops.
    Busy(watch::Receiver<()>),
}

/// Marks a name busy. Dropping it without [`settle`](Self::settle)
/// unregisters the name; either way waiters wake once it is gone.
struct BusySlot<'a> {
    registry: &'a GraphRegistry,
    name: String,
    settled: bool,
    _done: watch::Sender<()>,
}

impl BusySlot<'_> {
    fn settle(mut self, graph: Arc<Graph>) {
        self.registry
            .table_mut()
            .insert(self.name.clone(), Slot::Open(graph));
        self.settled = true;
    }
}

impl Drop for BusySlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.table_mut().remove(&self.name);
        }
    }
}

pub struct GraphRegistry {
    graphs: RwLock<HashMap<String, Slot>>,
    events: Arc<EventBus>,
    config: RegistryConfig,
}

impl GraphRegistry {
    pub fn new(config: RegistryConfig, events: Arc<EventBus>) -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            events,
            config,
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.graphs.read().unwrap_or_else(|p| p.into_inner())
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.graphs.write().unwrap_or_else(|p| p.into_inner())
    }

    fn busy(&self, name: &str, table: &mut HashMap<String, Slot>) -> BusySlot<'_> {
        let (done, waiting) = watch::channel(());
        table.insert(name.to_string(), Slot::Busy(waiting));
        BusySlot {
            registry: self,
            name: name.to_string(),
            settled: false,
            _done: done,
        }
    }

    /// Return the open graph `name`, opening it first if needed.
    ///
    /// Idempotent: `opts` only apply when the graph is opened here. The
    /// flag is `true` when this call opened it.
    pub async fn get_or_create(
        &self,
        name: &str,
        mut opts: GraphOptions,
    ) -> SidecarResult<(Arc<Graph>, bool)> {
        let slot = loop {
            // Fast path: read lock
            if let Some(Slot::Open(graph)) = self.table().get(name) {
                return Ok((graph.clone(), false));
            }

            let mut waiting = {
                let mut table = self.table_mut();
                match table.get(name) {
                    Some(Slot::Open(graph)) => return Ok((graph.clone(), false)),
                    Some(Slot::Busy(waiting)) => waiting.clone(),
                    None => break self.busy(name, &mut table),
                }
            };
            let _ = waiting.changed().await;
        };

        if let (Some(path), Some(data_dir)) = (&opts.path, &self.config.data_dir) {
            if path.is_relative() {
                opts.path = Some(data_dir.join(path));
            }
        }
        let owned_name = name.to_string();
        let default_cache = self.config.default_cache;
        let graph = tokio::task::spawn_blocking(move || Graph::open(&owned_name, opts, default_cache))
            .await??;
        let graph = Arc::new(graph);
        slot.settle(graph.clone());

        log::info!(
            "Opened graph {name} ({})",
            graph
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "in-memory".into())
        );
        self.events.publish(Event::GraphOpened {
            name: name.to_string(),
            created: true,
        });
        Ok((graph, true))
    }

    /// The open graph `name`. Graphs still opening or being removed are
    /// not found.
    pub async fn get(&self, name: &str) -> SidecarResult<Arc<Graph>> {
        match self.table().get(name) {
            Some(Slot::Open(graph)) => Ok(graph.clone()),
            _ => Err(SidecarError::GraphNotFound(name.to_string())),
        }
    }

    /// Drain, flush, delete every page and unregister. Unknown names are a
    /// no-op returning `false`.
    ///
    /// The name is unregistered even when draining or deleting fails, so a
    /// later `get_or_create` opens a fresh handle.
    pub async fn remove(&self, name: &str) -> SidecarResult<bool> {
        let (graph, _slot) = loop {
            let mut waiting = {
                let mut table = self.table_mut();
                match table.get(name) {
                    None => return Ok(false),
                    Some(Slot::Busy(waiting)) => waiting.clone(),
                    Some(Slot::Open(graph)) => {
                        let graph = graph.clone();
                        break (graph, self.busy(name, &mut table));
                    }
                }
            };
            let _ = waiting.changed().await;
        };

        let removed = async {
            graph.drain().await?;
            let storage = graph.storage.clone();
            tokio::task::spawn_blocking(move || storage.delete_all())
                .await?
                .map_err(factd_core::CoreError::from)?;
            SidecarResult::Ok(())
        }
        .await;
        if let Err(e) = removed {
            log::error!("Failed to remove graph {name}, unregistered anyway: {e}");
            return Err(e);
        }

        log::info!("Removed graph {name}");
        self.events.publish(Event::GraphRemoved {
            name: name.to_string(),
        });
        Ok(true)
    }

    /// Names of open graphs, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.table()
            .values()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drain and flush every open graph, keeping their pages. Used on
    /// shutdown.
    pub async fn close_all(&self) {
        let open: Vec<(String, Arc<Graph>)> = {
            let mut table = self.table_mut();
            let names: Vec<String> = table
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| match table.remove(&name) {
                    Some(Slot::Open(graph)) => Some((name, graph)),
                    _ => None,
                })
                .collect()
        };
        for (name, graph) in open {
            match graph.drain().await {
                Ok(()) => log::info!("Closed graph {name}"),
                Err(e) => log::error!("Failed to flush graph {name}: {e}"),
            }
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factd_core::{AttrSpec, Schema, TxOp, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry() -> GraphRegistry {
        GraphRegistry::new(RegistryConfig::default(), Arc::new(EventBus::new(16)))
    }

    fn schema() -> Schema {
        Schema::new().with("block/uuid", AttrSpec::identity())
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry();
        let mut events = registry.events().subscribe();
        let (a, created_a) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        let (b, created_b) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.names().await, vec!["g".to_string()]);
        assert_eq!(events.recv().await.unwrap().event, "graph-opened");
    }

    #[tokio::test]
    async fn test_concurrent_create_opens_once() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("g", GraphOptions::default()).await.unwrap().1
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_graph() {
        let registry = registry();
        let err = registry.get("missing").await.err().unwrap();
        assert_eq!(err.error_type().as_str(), "graph-not-found");
        assert!(!registry.remove("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_discards_pages() {
        let registry = registry();
        let opts = GraphOptions {
            schema: schema(),
            ..GraphOptions::default()
        };
        let (graph, _) = registry.get_or_create("g", opts).await.unwrap();
        graph
            .write(|store| {
                Ok(store.transact(
                    vec![TxOp::entity([("block/uuid", Value::str("u1"))])],
                    None,
                )?)
            })
            .await
            .unwrap();
        let storage = graph.storage().clone();
        assert!(!storage.list_addresses().unwrap().is_empty());

        assert!(registry.remove("g").await.unwrap());
        assert!(storage.list_addresses().unwrap().is_empty());
        assert!(graph.queue().is_closed());
        assert!(registry.get("g").await.is_err());

        // Reopening under the same name starts empty
        let (fresh, created) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        assert!(created);
        assert_eq!(fresh.store().stats().datoms, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_does_not_stall_other_graphs() {
        let registry = Arc::new(registry());
        let (slow, _) = registry.get_or_create("slow", GraphOptions::default()).await.unwrap();
        registry.get_or_create("other", GraphOptions::default()).await.unwrap();

        let queued = slow.write(|_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        });
        let removing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = Duration::from_millis(200);
        assert!(timeout(quick, registry.get("other")).await.unwrap().is_ok());
        let (fresh, created) = timeout(quick, registry.get_or_create("fresh", GraphOptions::default()))
            .await
            .unwrap()
            .unwrap();
        assert!(created);
        assert_eq!(fresh.name(), "fresh");
        assert!(registry.get("slow").await.is_err());
        assert_eq!(registry.names().await, vec!["fresh".to_string(), "other".to_string()]);

        queued.await.unwrap();
        assert!(removing.await.unwrap().unwrap());
        assert!(!registry.remove("slow").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_waits_for_pending_removal() {
        let registry = Arc::new(registry());
        let (graph, _) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        let queued = graph.write(|_| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        let removing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("g").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (reopened, created) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&graph, &reopened));
        assert!(!reopened.queue().is_closed());
        queued.await.unwrap();
        assert!(removing.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_failed_removal_unregisters() {
        let registry = registry();
        let backing = Arc::new(MemoryBackingStore::new());
        let graph = Graph::with_backing(
            "g",
            GraphOptions::default(),
            backing.clone(),
            CacheConfig::default(),
        )
        .unwrap();
        registry
            .table_mut()
            .insert("g".to_string(), Slot::Open(Arc::new(graph)));

        backing.reject_writes(true);
        assert!(registry.remove("g").await.is_err());
        backing.reject_writes(false);
        assert!(registry.get("g").await.is_err());

        let (fresh, created) = registry.get_or_create("g", GraphOptions::default()).await.unwrap();
        assert!(created);
        fresh
            .write(|store| Ok(store.transact(vec![TxOp::entity([("name", Value::str("x"))])], None)?))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reads_and_writes() {
        let registry = registry();
        let (graph, _) = registry
            .get_or_create(
                "g",
                GraphOptions {
                    schema: schema(),
                    ..GraphOptions::default()
                },
            )
            .await
            .unwrap();
        graph
            .write(|store| {
                Ok(store.transact(
                    vec![TxOp::entity([
                        ("block/uuid", Value::str("u1")),
                        ("block/content", Value::str("hello")),
                    ])],
                    None,
                )?)
            })
            .await
            .unwrap();
        let found = graph
            .read(|store| {
                Ok(store.query(
                    "[:find ?c . :where [?e :block/uuid \"u1\"] [?e :block/content ?c]]",
                    &[],
                )?)
            })
            .await
            .unwrap();
        assert_eq!(found, Value::str("hello"));
        let stats = graph.stats().unwrap();
        assert_eq!(stats.store.datoms, 2);
        assert_eq!(stats.queue.completed, 1);
    }
}
