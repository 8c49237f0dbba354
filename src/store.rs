//! In-memory flag and segment storage.
//!
//! Readers load a lock-free snapshot through [arc_swap::ArcSwap]; writers
//! are serialized by a mutex and publish whole new snapshots, so `init`
//! is atomic with respect to concurrent readers and individual upserts
//! are pointwise atomic.

use crate::models::{Flag, Segment};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The two kinds of stored items. Segments sort before flags so that a
/// dependency-ordered `init` writes them first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Segment,
    Flag,
}

impl DataKind {
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Flag => "flag",
            DataKind::Segment => "segment",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A live stored item of either kind.
#[derive(Clone, Debug)]
pub enum StoreItem {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
}

impl StoreItem {
    pub fn kind(&self) -> DataKind {
        match self {
            StoreItem::Flag(_) => DataKind::Flag,
            StoreItem::Segment(_) => DataKind::Segment,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(f) => &f.key,
            StoreItem::Segment(s) => &s.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
        }
    }

    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            StoreItem::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            StoreItem::Segment(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Flag> for StoreItem {
    fn from(flag: Flag) -> Self {
        StoreItem::Flag(Arc::new(flag))
    }
}

impl From<Segment> for StoreItem {
    fn from(segment: Segment) -> Self {
        StoreItem::Segment(Arc::new(segment))
    }
}

/// A stored slot: either a live item or a tombstone remembering the
/// version at which the item was deleted, so late out-of-order writes
/// are still rejected.
#[derive(Clone, Debug)]
pub enum ItemDescriptor {
    Item(StoreItem),
    Tombstone(u64),
}

impl ItemDescriptor {
    pub fn version(&self) -> u64 {
        match self {
            ItemDescriptor::Item(item) => item.version(),
            ItemDescriptor::Tombstone(version) => *version,
        }
    }

    pub fn item(&self) -> Option<&StoreItem> {
        match self {
            ItemDescriptor::Item(item) => Some(item),
            ItemDescriptor::Tombstone(_) => None,
        }
    }
}

/// A complete data set, as supplied to `init`. Tombstones are permitted
/// but invisible to enumeration.
#[derive(Clone, Debug, Default)]
pub struct AllData {
    pub flags: HashMap<String, ItemDescriptor>,
    pub segments: HashMap<String, ItemDescriptor>,
}

impl AllData {
    pub fn collection(&self, kind: DataKind) -> &HashMap<String, ItemDescriptor> {
        match kind {
            DataKind::Flag => &self.flags,
            DataKind::Segment => &self.segments,
        }
    }

    fn collection_mut(&mut self, kind: DataKind) -> &mut HashMap<String, ItemDescriptor> {
        match kind {
            DataKind::Flag => &mut self.flags,
            DataKind::Segment => &mut self.segments,
        }
    }

    /// Live items of one kind, tombstones filtered out.
    pub fn live(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.collection(kind)
            .iter()
            .filter_map(|(key, descriptor)| {
                descriptor.item().map(|item| (key.clone(), item.clone()))
            })
            .collect()
    }
}

/// Read access to flag and segment data, as the evaluator sees it.
pub trait Store: Send + Sync {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;
    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem>;
    fn is_initialized(&self) -> bool;

    fn flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.get(DataKind::Flag, key)
            .and_then(|item| item.as_flag().cloned())
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.get(DataKind::Segment, key)
            .and_then(|item| item.as_segment().cloned())
    }
}

impl<T: Store> Store for Arc<T> {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        self.as_ref().get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.as_ref().all(kind)
    }

    fn is_initialized(&self) -> bool {
        self.as_ref().is_initialized()
    }
}

/// Outcome of a versioned write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertResult {
    /// The write was accepted; the item's version or existence changed.
    Applied,
    /// A stored version at least as new was already present.
    Stale,
}

impl UpsertResult {
    pub fn applied(&self) -> bool {
        matches!(self, UpsertResult::Applied)
    }
}

#[derive(Debug, Default)]
struct Contents {
    data: AllData,
    initialized: bool,
}

/// The in-memory store.
pub struct MemoryStore {
    contents: ArcSwap<Contents>,
    // serializes writers; readers go through the ArcSwap only
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entire data set.
    pub fn init(&self, data: AllData) {
        let _guard = self.write_lock.lock();
        self.contents.store(Arc::new(Contents {
            data,
            initialized: true,
        }));
    }

    /// Write one slot if `descriptor` carries a strictly greater version
    /// than what is stored (live or tombstoned) under the key.
    pub fn upsert(&self, kind: DataKind, key: &str, descriptor: ItemDescriptor) -> UpsertResult {
        let _guard = self.write_lock.lock();
        let mut data = {
            let current = self.contents.load();
            if let Some(existing) = current.data.collection(kind).get(key) {
                if existing.version() >= descriptor.version() {
                    return UpsertResult::Stale;
                }
            }
            current.data.clone()
        };
        data.collection_mut(kind).insert(key.to_string(), descriptor);
        self.contents.store(Arc::new(Contents {
            data,
            initialized: true,
        }));
        UpsertResult::Applied
    }

    /// The stored slot including tombstones; used for diffing and
    /// version checks, not evaluation.
    pub fn get_descriptor(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        self.contents.load().data.collection(kind).get(key).cloned()
    }

    /// A copy of the full data set including tombstones.
    pub fn export(&self) -> AllData {
        self.contents.load().data.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            contents: ArcSwap::new(Arc::new(Contents::default())),
            write_lock: Mutex::new(()),
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        self.contents
            .load()
            .data
            .collection(kind)
            .get(key)
            .and_then(|descriptor| descriptor.item().cloned())
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.contents.load().data.live(kind)
    }

    fn is_initialized(&self) -> bool {
        self.contents.load().initialized
    }
}
