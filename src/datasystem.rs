//! The data system: obtains configuration from the control plane,
//! reconciles it into the store, and propagates change notifications.
//!
//! Two phases run under one orchestrator task. Initializers are tried
//! in order until one produces a basis; then synchronizers run one at a
//! time, with promotion to the next on termination or on failure to
//! become healthy within a bounded period. A `revert_to_fdv1` signal
//! permanently abandons the v2 synchronizers in favor of the configured
//! v1-compatible one.

use crate::broadcast::{drain_worker, Broadcaster, FlagChange};
use crate::changeset::{ChangeAction, ChangeSet, IntentCode, Selector};
use crate::dependency::{DependencyTracker, ItemKey};
use crate::store::{AllData, DataKind, ItemDescriptor};
use crate::store_wrapper::{PersistentStoreError, StoreWrapper};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a fresh synchronizer may stay unhealthy before the next one
/// is promoted.
pub const DEFAULT_SYNCHRONIZER_DEADLINE: Duration = Duration::from_secs(60);

/// State reported by a synchronizer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    Initializing,
    Valid,
    Interrupted,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    Unknown,
    NetworkError,
    ErrorResponse,
    InvalidData,
    StoreError,
}

#[derive(Clone, Debug)]
pub struct ErrorInfo {
    pub kind: DataSourceErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: SystemTime,
}

impl ErrorInfo {
    fn of(kind: DataSourceErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            time: SystemTime::now(),
        }
    }

    pub fn network(message: String) -> Self {
        Self::of(DataSourceErrorKind::NetworkError, None, message)
    }

    pub fn response(status_code: u16) -> Self {
        Self::of(
            DataSourceErrorKind::ErrorResponse,
            Some(status_code),
            format!("HTTP error {}", status_code),
        )
    }

    pub fn invalid_data(message: String) -> Self {
        Self::of(DataSourceErrorKind::InvalidData, None, message)
    }

    pub fn store(message: String) -> Self {
        Self::of(DataSourceErrorKind::StoreError, None, message)
    }
}

/// Status of the data source as observable by the application.
#[derive(Clone, Debug)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub state_since: SystemTime,
    pub last_error: Option<ErrorInfo>,
}

/// What the SDK can currently serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataAvailability {
    /// No data yet; evaluations fall back to application defaults.
    Defaults,
    /// Data exists (persistent store or an initializer) but no
    /// synchronizer has confirmed it fresh.
    Cached,
    /// A synchronizer has reported a valid payload at least once.
    Refreshed,
}

impl DataAvailability {
    pub fn at_least(&self, other: DataAvailability) -> bool {
        *self >= other
    }
}

/// One message from a synchronizer session, in protocol order.
#[derive(Debug)]
pub struct Update {
    pub state: DataSourceState,
    pub change_set: Option<ChangeSet>,
    pub error: Option<ErrorInfo>,
    pub revert_to_fdv1: bool,
    pub environment_id: Option<String>,
}

impl Update {
    pub fn valid(change_set: ChangeSet, environment_id: Option<String>) -> Self {
        Self {
            state: DataSourceState::Valid,
            change_set: Some(change_set),
            error: None,
            revert_to_fdv1: false,
            environment_id,
        }
    }

    pub fn interrupted(error: ErrorInfo, environment_id: Option<String>) -> Self {
        Self {
            state: DataSourceState::Interrupted,
            change_set: None,
            error: Some(error),
            revert_to_fdv1: false,
            environment_id,
        }
    }

    pub fn off(error: ErrorInfo, environment_id: Option<String>) -> Self {
        Self {
            state: DataSourceState::Off,
            change_set: None,
            error: Some(error),
            revert_to_fdv1: false,
            environment_id,
        }
    }
}

/// Result of a one-shot fetch used to seed the store before any
/// synchronizer connects.
#[derive(Debug)]
pub struct Basis {
    pub change_set: ChangeSet,
    pub environment_id: Option<String>,
}

/// A one-shot source of initial data.
pub trait Initializer: Send {
    fn name(&self) -> &'static str;
    fn fetch(&mut self) -> BoxFuture<'_, Result<Basis, ErrorInfo>>;
}

/// A running synchronizer session: the update stream plus the worker
/// task feeding it (absent for purely in-process sources). The
/// orchestrator joins the worker, bounded, when it tears the session
/// down.
pub struct SyncSession {
    pub updates: BoxStream<'static, Update>,
    pub task: Option<JoinHandle<()>>,
}

/// A long-running source of updates. The stream ends only when the
/// synchronizer has given up (unrecoverable error); transient faults
/// are reported as `Interrupted` updates and retried internally.
pub trait Synchronizer: Send {
    fn name(&self) -> &'static str;
    fn sync(self: Box<Self>, selector: Option<Selector>) -> SyncSession;
}

/// The ordered sources the orchestrator runs.
pub struct DataSourceSet {
    pub initializers: Vec<Box<dyn Initializer>>,
    pub synchronizers: Vec<Box<dyn Synchronizer>>,
    /// Started (once) if a v2 source signals `revert_to_fdv1`.
    pub fdv1_fallback: Option<Box<dyn Synchronizer>>,
}

impl DataSourceSet {
    pub fn empty() -> Self {
        Self {
            initializers: Vec::new(),
            synchronizers: Vec::new(),
            fdv1_fallback: None,
        }
    }
}

/// Orchestrates sources, applies change-sets, tracks dependencies and
/// fans out flag-change notifications.
pub struct DataSystem {
    wrapper: StoreWrapper,
    tracker: Mutex<DependencyTracker>,
    flag_changes: Broadcaster<FlagChange>,
    status: Mutex<DataSourceStatus>,
    status_broadcaster: Broadcaster<DataSourceStatus>,
    availability: Mutex<DataAvailability>,
    selector: Mutex<Option<Selector>>,
    environment_id: Mutex<Option<String>>,
    ready: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    synchronizer_deadline: Duration,
}

impl DataSystem {
    pub fn new(wrapper: StoreWrapper) -> Self {
        let (ready, ready_rx) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            wrapper,
            tracker: Mutex::new(DependencyTracker::new()),
            flag_changes: Broadcaster::new("flag-change"),
            status: Mutex::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: SystemTime::now(),
                last_error: None,
            }),
            status_broadcaster: Broadcaster::new("data-source-status"),
            availability: Mutex::new(DataAvailability::Defaults),
            selector: Mutex::new(None),
            environment_id: Mutex::new(None),
            ready,
            ready_rx,
            shutdown,
            shutdown_rx,
            task: Mutex::new(None),
            synchronizer_deadline: DEFAULT_SYNCHRONIZER_DEADLINE,
        }
    }

    /// Shorten or lengthen the unhealthy-synchronizer promotion window.
    pub fn synchronizer_deadline(mut self, deadline: Duration) -> Self {
        self.synchronizer_deadline = deadline;
        self
    }

    pub fn flag_change_broadcaster(&self) -> &Broadcaster<FlagChange> {
        &self.flag_changes
    }

    pub fn status_broadcaster(&self) -> &Broadcaster<DataSourceStatus> {
        &self.status_broadcaster
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.lock().clone()
    }

    pub fn data_availability(&self) -> DataAvailability {
        *self.availability.lock()
    }

    pub fn environment_id(&self) -> Option<String> {
        self.environment_id.lock().clone()
    }

    /// Launch the orchestrator. The returned receiver flips to `true`
    /// when the system first reaches `Refreshed` availability or a
    /// terminal `Off` state.
    pub fn start(self: Arc<Self>, sources: DataSourceSet) -> watch::Receiver<bool> {
        if self.wrapper.has_cached_data() {
            self.set_availability(DataAvailability::Cached);
        }
        let ready = self.ready_rx.clone();
        let system = Arc::clone(&self);
        let task = tokio::spawn(async move {
            system.run(sources).await;
        });
        *self.task.lock() = Some(task);
        ready
    }

    /// Resolve once initial startup has finished (successfully or not).
    pub async fn wait_ready(&self) {
        let mut ready = self.ready_rx.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent: signals all workers, waits for them to drain with a
    /// bounded join, then stops notification dispatch and the store
    /// stack.
    pub async fn stop(&self) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            drain_worker("data-system", task).await;
        }
        self.flag_changes.shutdown().await;
        self.status_broadcaster.shutdown().await;
        self.wrapper.stop().await;
    }

    // -- orchestration ------------------------------------------------------

    async fn run(self: Arc<Self>, mut sources: DataSourceSet) {
        let mut shutdown = self.shutdown_rx.clone();

        // phase 1: first successful initializer seeds the store
        for initializer in sources.initializers.iter_mut() {
            if *shutdown.borrow() {
                return;
            }
            debug!(name = initializer.name(), "running initializer");
            match initializer.fetch().await {
                Ok(basis) => {
                    if let Some(env) = basis.environment_id {
                        *self.environment_id.lock() = Some(env);
                    }
                    match self.apply_change_set(&basis.change_set) {
                        Ok(()) => {
                            info!(name = initializer.name(), "initial data available");
                            self.set_availability(DataAvailability::Cached);
                            break;
                        }
                        Err(e) => {
                            self.transition(
                                DataSourceState::Interrupted,
                                Some(ErrorInfo::store(e.to_string())),
                            );
                        }
                    }
                }
                Err(error) => {
                    warn!(name = initializer.name(), message = %error.message, "initializer failed");
                }
            }
        }

        // phase 2: one synchronizer at a time
        let mut pending: Vec<Box<dyn Synchronizer>> = sources.synchronizers.drain(..).collect();
        pending.reverse(); // pop() yields the configured order
        let mut reverted = false;

        while let Some(synchronizer) = pending.pop() {
            let name = synchronizer.name();
            info!(name, "starting synchronizer");
            let selector = self.selector.lock().clone();
            let SyncSession {
                updates: mut stream,
                task,
            } = synchronizer.sync(selector);

            let deadline = tokio::time::Instant::now() + self.synchronizer_deadline;
            let mut seen_valid = false;
            let mut switch_to_fallback = false;
            let mut stopping = false;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            stopping = true;
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline), if !seen_valid => {
                        warn!(name, "synchronizer did not become healthy in time");
                        break;
                    }
                    update = stream.next() => match update {
                        None => {
                            warn!(name, "synchronizer terminated");
                            break;
                        }
                        Some(update) => {
                            if update.revert_to_fdv1 && !reverted {
                                info!(name, "server requested fallback to the v1 protocol");
                                reverted = true;
                                switch_to_fallback = true;
                                break;
                            }
                            if update.state == DataSourceState::Valid {
                                seen_valid = true;
                            }
                            self.handle_update(update);
                        }
                    }
                }
            }

            // dropping the stream tells the worker its consumer is
            // gone; join it before moving on
            drop(stream);
            if let Some(task) = task {
                drain_worker(name, task).await;
            }
            if stopping {
                return;
            }

            if switch_to_fallback {
                // one-way: the remaining v2 synchronizers never run again
                pending.clear();
                if let Some(fallback) = sources.fdv1_fallback.take() {
                    pending.push(fallback);
                } else {
                    warn!("fallback requested but no v1 synchronizer is configured");
                }
            }
        }

        if !*shutdown.borrow() {
            info!("all synchronizers exhausted, giving up");
            self.transition(
                DataSourceState::Off,
                Some(ErrorInfo::of(
                    DataSourceErrorKind::Unknown,
                    None,
                    "no remaining data sources".to_string(),
                )),
            );
            let _ = self.ready.send(true);
        }
    }

    fn handle_update(&self, update: Update) {
        if let Some(env) = update.environment_id {
            *self.environment_id.lock() = Some(env);
        }
        match update.state {
            DataSourceState::Valid => {
                let applied = match &update.change_set {
                    Some(change_set) => self.apply_change_set(change_set),
                    None => Ok(()),
                };
                match applied {
                    Ok(()) => {
                        self.transition(DataSourceState::Valid, None);
                        self.set_availability(DataAvailability::Refreshed);
                        let _ = self.ready.send(true);
                    }
                    Err(e) => {
                        self.transition(
                            DataSourceState::Interrupted,
                            Some(ErrorInfo::store(e.to_string())),
                        );
                    }
                }
            }
            state => self.transition(state, update.error),
        }
    }

    fn transition(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let status = {
            let mut status = self.status.lock();
            let changed = status.state != state || error.is_some();
            if status.state != state {
                status.state = state;
                status.state_since = SystemTime::now();
            }
            if let Some(error) = error {
                status.last_error = Some(error);
            }
            if !changed {
                return;
            }
            status.clone()
        };
        self.status_broadcaster.broadcast(status);
    }

    fn set_availability(&self, availability: DataAvailability) {
        let mut current = self.availability.lock();
        // availability never regresses
        if availability > *current {
            *current = availability;
        }
    }

    // -- change-set application --------------------------------------------

    /// Apply one change-set to the store, keep the dependency graph
    /// consistent, and notify flag-change listeners for the transitive
    /// closure of affected flags. Serialized by the orchestrator task.
    pub fn apply_change_set(&self, change_set: &ChangeSet) -> Result<(), PersistentStoreError> {
        let mut tracker = self.tracker.lock();
        let affected = match change_set.intent_code {
            None | Some(IntentCode::TransferNone) => HashSet::new(),
            Some(IntentCode::TransferFull) => self.apply_full(&mut tracker, change_set)?,
            Some(IntentCode::TransferChanges) => self.apply_delta(&mut tracker, change_set)?,
        };

        let mut closure = HashSet::new();
        for key in &affected {
            tracker.add_affected_items(&mut closure, key);
        }
        drop(tracker);

        if let Some(selector) = &change_set.selector {
            *self.selector.lock() = Some(selector.clone());
        }

        let mut changed_flags: Vec<String> = closure
            .into_iter()
            .filter(|item| item.kind == DataKind::Flag)
            .map(|item| item.key)
            .collect();
        changed_flags.sort();
        for key in changed_flags {
            self.flag_changes.broadcast(FlagChange { key });
        }
        Ok(())
    }

    fn apply_full(
        &self,
        tracker: &mut DependencyTracker,
        change_set: &ChangeSet,
    ) -> Result<HashSet<ItemKey>, PersistentStoreError> {
        let mut data = AllData::default();
        for change in &change_set.changes {
            let descriptor = match &change.action {
                ChangeAction::Put(item) => ItemDescriptor::Item(item.clone()),
                ChangeAction::Delete => ItemDescriptor::Tombstone(change.version),
            };
            let collection = match change.kind {
                DataKind::Flag => &mut data.flags,
                DataKind::Segment => &mut data.segments,
            };
            collection.insert(change.key.clone(), descriptor);
        }

        // diff against the current contents before replacing them
        let previous = self.wrapper.export();
        let mut affected = HashSet::new();
        for kind in &[DataKind::Flag, DataKind::Segment] {
            let old = previous.collection(*kind);
            let new = data.collection(*kind);
            for (key, descriptor) in new {
                let same = old.get(key).map_or(false, |existing| {
                    existing.version() == descriptor.version()
                        && existing.item().is_some() == descriptor.item().is_some()
                });
                if !same {
                    affected.insert(ItemKey {
                        kind: *kind,
                        key: key.clone(),
                    });
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    affected.insert(ItemKey {
                        kind: *kind,
                        key: key.clone(),
                    });
                }
            }
        }

        self.wrapper.init(data)?;
        tracker.reset_from(&self.wrapper.export());
        Ok(affected)
    }

    fn apply_delta(
        &self,
        tracker: &mut DependencyTracker,
        change_set: &ChangeSet,
    ) -> Result<HashSet<ItemKey>, PersistentStoreError> {
        let mut affected = HashSet::new();
        for change in &change_set.changes {
            let item_key = ItemKey {
                kind: change.kind,
                key: change.key.clone(),
            };
            let (descriptor, new_item) = match &change.action {
                ChangeAction::Put(item) => {
                    (ItemDescriptor::Item(item.clone()), Some(item.clone()))
                }
                ChangeAction::Delete => (ItemDescriptor::Tombstone(change.version), None),
            };
            let result = self.wrapper.upsert(change.kind, &change.key, descriptor)?;
            if result.applied() {
                tracker.update_dependencies_of(item_key.clone(), new_item.as_ref());
                affected.insert(item_key);
            } else {
                debug!(kind = %change.kind, key = %change.key, version = change.version,
                       "discarded stale change");
            }
        }
        Ok(affected)
    }
}
