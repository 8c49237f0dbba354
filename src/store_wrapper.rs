//! Store wrapper: routes reads and writes between the in-memory store
//! and an optional persistent store, and monitors the latter for
//! outages.
//!
//! Persistent write failures are re-raised to the caller (administrative
//! writers must know the write was not accepted); at the same time the
//! store-status broadcaster is notified and, when the adapter supports
//! monitoring, a recovery poller starts probing until the store comes
//! back. A recovered store whose data went stale during the outage is
//! re-seeded from the in-memory snapshot.

use crate::broadcast::{drain_worker, Broadcaster};
use crate::dependency::sorted_collections;
use crate::store::{
    AllData, DataKind, ItemDescriptor, MemoryStore, Store, StoreItem, UpsertResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, thiserror::Error)]
#[error("persistent store error: {0}")]
pub struct PersistentStoreError(pub String);

/// The external persistent feature store (Redis, DynamoDB, ...).
/// Adapters are out of scope; this is the surface the core consumes.
/// Writes are expected to enforce version monotonicity themselves.
pub trait PersistentStore: Send + Sync {
    fn init(
        &self,
        data: &[(DataKind, Vec<(String, ItemDescriptor)>)],
    ) -> Result<(), PersistentStoreError>;
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, PersistentStoreError>;
    fn all(&self, kind: DataKind) -> Result<HashMap<String, ItemDescriptor>, PersistentStoreError>;
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, PersistentStoreError>;
    fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<bool, PersistentStoreError>;
    fn initialized(&self) -> bool;

    /// Capability probe: whether `available` gives a meaningful answer.
    fn monitoring_enabled(&self) -> bool {
        false
    }
    fn available(&self) -> bool {
        true
    }
    /// Whether the store's data may have been lost or gone stale while
    /// it was unavailable, requiring a re-init after recovery.
    fn data_stale(&self) -> bool {
        false
    }
    fn stop(&self) {}
}

/// Availability of the persistent tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    pub available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Daemon mode: the persistent store is maintained externally and
    /// serves all reads; nothing is ever written.
    ReadOnly,
    /// The persistent store mirrors every write applied to memory.
    ReadWrite,
}

/// The store stack handed to the data system and the evaluator.
///
/// Cheap to clone; clones share the same stores and status.
#[derive(Clone)]
pub struct StoreWrapper {
    inner: Arc<WrapperInner>,
}

struct WrapperInner {
    memory: MemoryStore,
    persistent: Option<(Arc<dyn PersistentStore>, PersistenceMode)>,
    status: Mutex<DataStoreStatus>,
    broadcaster: Broadcaster<DataStoreStatus>,
    recovery_running: AtomicBool,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
    recovery_poll_interval: Duration,
    stopped: AtomicBool,
}

impl StoreWrapper {
    /// Memory-only stack.
    pub fn new() -> Self {
        Self::build(None, DEFAULT_RECOVERY_POLL_INTERVAL)
    }

    pub fn with_persistent(store: Arc<dyn PersistentStore>, mode: PersistenceMode) -> Self {
        Self::build(Some((store, mode)), DEFAULT_RECOVERY_POLL_INTERVAL)
    }

    pub fn with_persistent_and_poll_interval(
        store: Arc<dyn PersistentStore>,
        mode: PersistenceMode,
        recovery_poll_interval: Duration,
    ) -> Self {
        Self::build(Some((store, mode)), recovery_poll_interval)
    }

    fn build(
        persistent: Option<(Arc<dyn PersistentStore>, PersistenceMode)>,
        recovery_poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WrapperInner {
                memory: MemoryStore::new(),
                persistent,
                status: Mutex::new(DataStoreStatus { available: true }),
                broadcaster: Broadcaster::new("data-store-status"),
                recovery_running: AtomicBool::new(false),
                recovery_task: Mutex::new(None),
                recovery_poll_interval,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn status_broadcaster(&self) -> &Broadcaster<DataStoreStatus> {
        &self.inner.broadcaster
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.inner.status.lock()
    }

    /// Whether a persistent tier exists and already holds data, which
    /// lets the SDK serve cached values before any synchronizer
    /// connects.
    pub fn has_cached_data(&self) -> bool {
        match &self.inner.persistent {
            Some((store, _)) => store.initialized(),
            None => false,
        }
    }

    /// Replace everything. The persistent store receives the data in
    /// dependency-safe order: segments before flags, prerequisites
    /// before their dependents.
    pub fn init(&self, data: AllData) -> Result<(), PersistentStoreError> {
        self.inner.memory.init(data);
        if let Some((store, PersistenceMode::ReadWrite)) = &self.inner.persistent {
            let sorted = sorted_collections(&self.inner.memory.export());
            if let Err(e) = store.init(&sorted) {
                self.note_write_failure(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        descriptor: ItemDescriptor,
    ) -> Result<UpsertResult, PersistentStoreError> {
        let result = self.inner.memory.upsert(kind, key, descriptor.clone());
        if let Some((store, PersistenceMode::ReadWrite)) = &self.inner.persistent {
            let written = match descriptor {
                ItemDescriptor::Tombstone(version) => store.delete(kind, key, version),
                ItemDescriptor::Item(_) => store.upsert(kind, key, descriptor),
            };
            if let Err(e) = written {
                self.note_write_failure(&e);
                return Err(e);
            }
        }
        Ok(result)
    }

    /// The stored slot including tombstones, from the tier that serves
    /// reads.
    pub fn get_descriptor(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        self.inner.memory.get_descriptor(kind, key)
    }

    pub fn export(&self) -> AllData {
        self.inner.memory.export()
    }

    /// Idempotent: waits for the recovery poller to exit with a
    /// bounded join, then releases the persistent store and stops
    /// status dispatch.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.inner.recovery_task.lock().take();
        if let Some(task) = task {
            drain_worker("store-recovery-poller", task).await;
        }
        if let Some((store, _)) = &self.inner.persistent {
            store.stop();
        }
        self.inner.broadcaster.shutdown().await;
    }
}

impl Default for StoreWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreWrapper {
    fn note_write_failure(&self, error: &PersistentStoreError) {
        error!(%error, "persistent store write failed");
        self.inner.set_availability(false);
        self.start_recovery_poller();
    }

    fn start_recovery_poller(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let store = match &self.inner.persistent {
            Some((store, _)) if store.monitoring_enabled() => Arc::clone(store),
            _ => return,
        };
        if self.inner.recovery_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.inner.recovery_running.store(false, Ordering::SeqCst);
                warn!("no async runtime available, skipping store recovery polling");
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let task = handle.spawn(async move {
            loop {
                tokio::time::sleep(inner.recovery_poll_interval).await;
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if !store.available() {
                    continue;
                }
                info!("persistent store is available again");
                if store.data_stale() {
                    let sorted = sorted_collections(&inner.memory.export());
                    if let Err(e) = store.init(&sorted) {
                        warn!(error = %e, "re-init after store recovery failed");
                        continue;
                    }
                }
                inner.recovery_running.store(false, Ordering::SeqCst);
                inner.set_availability(true);
                return;
            }
        });
        *self.inner.recovery_task.lock() = Some(task);
    }
}

impl WrapperInner {
    fn set_availability(&self, available: bool) {
        let changed = {
            let mut status = self.status.lock();
            let changed = status.available != available;
            status.available = available;
            changed
        };
        if changed {
            self.broadcaster.broadcast(DataStoreStatus { available });
        }
    }
}

impl Store for StoreWrapper {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        if let Some((store, PersistenceMode::ReadOnly)) = &self.inner.persistent {
            return match store.get(kind, key) {
                Ok(descriptor) => descriptor.and_then(|d| d.item().cloned()),
                Err(error) => {
                    warn!(%error, %kind, key, "persistent store read failed");
                    None
                }
            };
        }
        self.inner.memory.get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if let Some((store, PersistenceMode::ReadOnly)) = &self.inner.persistent {
            return match store.all(kind) {
                Ok(descriptors) => descriptors
                    .into_iter()
                    .filter_map(|(key, d)| d.item().cloned().map(|item| (key, item)))
                    .collect(),
                Err(error) => {
                    warn!(%error, %kind, "persistent store enumeration failed");
                    HashMap::new()
                }
            };
        }
        self.inner.memory.all(kind)
    }

    fn is_initialized(&self) -> bool {
        match &self.inner.persistent {
            Some((store, PersistenceMode::ReadOnly)) => store.initialized(),
            _ => self.inner.memory.is_initialized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{basis_of, FlagBuilder, SegmentBuilder};

    #[derive(Default)]
    struct FakePersistentStore {
        // (kind, key) -> descriptor
        data: Mutex<HashMap<(DataKind, String), ItemDescriptor>>,
        init_calls: Mutex<Vec<Vec<(DataKind, Vec<String>)>>>,
        initialized: AtomicBool,
        fail_writes: AtomicBool,
        currently_available: AtomicBool,
        stale: AtomicBool,
        monitoring: bool,
    }

    impl FakePersistentStore {
        fn monitored() -> Self {
            let store = Self {
                monitoring: true,
                ..Self::default()
            };
            store.currently_available.store(true, Ordering::SeqCst);
            store
        }
    }

    impl PersistentStore for FakePersistentStore {
        fn init(
            &self,
            data: &[(DataKind, Vec<(String, ItemDescriptor)>)],
        ) -> Result<(), PersistentStoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PersistentStoreError("write refused".to_string()));
            }
            self.init_calls.lock().push(
                data.iter()
                    .map(|(kind, items)| {
                        (*kind, items.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>())
                    })
                    .collect(),
            );
            let mut stored = self.data.lock();
            stored.clear();
            for (kind, items) in data {
                for (key, descriptor) in items {
                    stored.insert((*kind, key.clone()), descriptor.clone());
                }
            }
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn get(
            &self,
            kind: DataKind,
            key: &str,
        ) -> Result<Option<ItemDescriptor>, PersistentStoreError> {
            Ok(self.data.lock().get(&(kind, key.to_string())).cloned())
        }

        fn all(
            &self,
            kind: DataKind,
        ) -> Result<HashMap<String, ItemDescriptor>, PersistentStoreError> {
            Ok(self
                .data
                .lock()
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), d)| (key.clone(), d.clone()))
                .collect())
        }

        fn upsert(
            &self,
            kind: DataKind,
            key: &str,
            item: ItemDescriptor,
        ) -> Result<bool, PersistentStoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PersistentStoreError("write refused".to_string()));
            }
            self.data.lock().insert((kind, key.to_string()), item);
            Ok(true)
        }

        fn delete(
            &self,
            kind: DataKind,
            key: &str,
            version: u64,
        ) -> Result<bool, PersistentStoreError> {
            self.upsert(kind, key, ItemDescriptor::Tombstone(version))
                .map(|_| true)
        }

        fn initialized(&self) -> bool {
            self.initialized.load(Ordering::SeqCst)
        }

        fn monitoring_enabled(&self) -> bool {
            self.monitoring
        }

        fn available(&self) -> bool {
            self.currently_available.load(Ordering::SeqCst)
        }

        fn data_stale(&self) -> bool {
            self.stale.load(Ordering::SeqCst)
        }
    }

    fn sample_data() -> AllData {
        basis_of(
            vec![
                FlagBuilder::new("a").prerequisite("b", 0).build(),
                FlagBuilder::new("b").build(),
            ],
            vec![SegmentBuilder::new("s").build()],
        )
    }

    #[test]
    fn memory_only_round_trip() {
        let wrapper = StoreWrapper::new();
        wrapper.init(sample_data()).unwrap();
        assert!(wrapper.is_initialized());
        assert!(wrapper.flag("a").is_some());
        assert!(wrapper.segment("s").is_some());
    }

    #[test]
    fn read_write_mirrors_in_dependency_order() {
        let persistent = Arc::new(FakePersistentStore::default());
        let wrapper =
            StoreWrapper::with_persistent(persistent.clone(), PersistenceMode::ReadWrite);
        wrapper.init(sample_data()).unwrap();

        let calls = persistent.init_calls.lock();
        assert_eq!(calls.len(), 1);
        let ordering = &calls[0];
        assert_eq!(ordering[0].0, DataKind::Segment);
        assert_eq!(ordering[1].0, DataKind::Flag);
        let flags = &ordering[1].1;
        let pos = |k: &str| flags.iter().position(|x| x == k).unwrap();
        assert!(pos("b") < pos("a"));

        // reads still come from memory in read-write mode
        assert!(wrapper.flag("a").is_some());
    }

    #[test]
    fn read_only_serves_from_persistent_store() {
        let persistent = Arc::new(FakePersistentStore::default());
        persistent
            .init(&sorted_collections(&sample_data()))
            .unwrap();
        let wrapper = StoreWrapper::with_persistent(persistent, PersistenceMode::ReadOnly);

        // nothing was written to memory, reads are delegated
        assert!(wrapper.is_initialized());
        assert!(wrapper.has_cached_data());
        assert!(wrapper.flag("a").is_some());
        assert_eq!(wrapper.all(DataKind::Flag).len(), 2);
    }

    #[test]
    fn write_failure_is_reraised_and_flips_status() {
        let persistent = Arc::new(FakePersistentStore::default());
        let wrapper =
            StoreWrapper::with_persistent(persistent.clone(), PersistenceMode::ReadWrite);
        persistent.fail_writes.store(true, Ordering::SeqCst);

        let result = wrapper.init(sample_data());
        assert!(result.is_err());
        assert!(!wrapper.status().available);
        // the memory tier still took the write
        assert!(wrapper.flag("a").is_some());
    }

    #[tokio::test]
    async fn outage_recovery_restores_availability_and_reinits_stale_stores() {
        let persistent = Arc::new(FakePersistentStore::monitored());
        let wrapper = StoreWrapper::with_persistent_and_poll_interval(
            persistent.clone(),
            PersistenceMode::ReadWrite,
            Duration::from_millis(10),
        );
        wrapper.init(sample_data()).unwrap();
        assert_eq!(persistent.init_calls.lock().len(), 1);

        // outage: writes fail and the probe reports unavailable
        persistent.fail_writes.store(true, Ordering::SeqCst);
        persistent.currently_available.store(false, Ordering::SeqCst);
        persistent.stale.store(true, Ordering::SeqCst);
        let descriptor = ItemDescriptor::Item(FlagBuilder::new("c").version(2).build().into());
        assert!(wrapper.upsert(DataKind::Flag, "c", descriptor).is_err());
        assert!(!wrapper.status().available);

        // recovery: probe goes green, writes work again
        persistent.fail_writes.store(false, Ordering::SeqCst);
        persistent.currently_available.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(wrapper.status().available);
        // stale data triggered a full re-init from the memory snapshot
        let init_calls = persistent.init_calls.lock();
        assert_eq!(init_calls.len(), 2);
        let flags_written: &Vec<String> = &init_calls[1][1].1;
        assert!(flags_written.contains(&"c".to_string()));
    }
}
