//! Big-segment membership: cached access to an external store that
//! holds segment memberships too large to ship in the flag payload.
//!
//! Contexts are looked up under `base64(SHA-256(context_key))`; each
//! membership is a map from `"{segment_key}.g{generation}"` to an
//! explicit include/exclude boolean. A background poller watches the
//! store's metadata timestamp to classify results as healthy or stale.

use crate::broadcast::{drain_worker, Broadcaster};
use crate::detail::BigSegmentsStatus;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Membership of one context: segment reference to explicit
/// include/exclude. Absent references fall through to rule evaluation.
pub type Membership = HashMap<String, bool>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("big segment store error: {0}")]
pub struct BigSegmentStoreError(pub String);

/// Metadata from a cheap store query, used for staleness detection.
#[derive(Clone, Copy, Debug)]
pub struct StoreMetadata {
    /// Wall-clock millis of the last successful upstream sync.
    pub last_up_to_date: Option<u64>,
}

/// The external membership store, e.g. a Redis or DynamoDB adapter.
/// Implementations are expected to answer quickly; both methods are
/// called from worker tasks and from evaluations.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<StoreMetadata, BigSegmentStoreError>;
    fn get_membership(&self, context_hash: &str)
        -> Result<Option<Membership>, BigSegmentStoreError>;
    fn stop(&self) {}
}

/// Availability of the big-segment store as seen by the status poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// What one evaluation needs: a membership (possibly shared) plus the
/// health stamp to attach to the evaluation reason.
pub trait MembershipResolver: Send + Sync {
    fn query_membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus);
}

/// Settings for [BigSegmentStoreManager]; defaults follow the common
/// server-SDK values.
#[derive(Clone, Debug)]
pub struct BigSegmentsConfig {
    pub context_cache_size: usize,
    pub context_cache_time: Duration,
    pub status_poll_interval: Duration,
    pub stale_after: Duration,
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        Self {
            context_cache_size: 1000,
            context_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

struct CachedMembership {
    membership: Option<Arc<Membership>>,
    fetched_at: Instant,
}

/// Wraps a [BigSegmentStore] with an LRU+TTL membership cache and a
/// background status poller.
pub struct BigSegmentStoreManager {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    cache: Mutex<LruCache<String, CachedMembership>>,
    status: Mutex<Option<BigSegmentStoreStatus>>,
    broadcaster: Broadcaster<BigSegmentStoreStatus>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BigSegmentStoreManager {
    pub fn new(store: Arc<dyn BigSegmentStore>, config: BigSegmentsConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            store,
            cache: Mutex::new(LruCache::new(config.context_cache_size.max(1))),
            config,
            status: Mutex::new(None),
            broadcaster: Broadcaster::new("big-segments-status"),
            shutdown,
            shutdown_rx,
            poller: Mutex::new(None),
        }
    }

    pub fn status_broadcaster(&self) -> &Broadcaster<BigSegmentStoreStatus> {
        &self.broadcaster
    }

    /// Current store status, polling inline if the background poller
    /// has not produced one yet.
    pub fn status(&self) -> BigSegmentStoreStatus {
        if let Some(status) = *self.status.lock() {
            return status;
        }
        self.poll_status_once()
    }

    /// Launch the background status poller. Call once, from within a
    /// runtime; `stop` ends it.
    pub fn start_polling(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let mut shutdown = self.shutdown_rx.clone();
        let task = tokio::spawn(async move {
            loop {
                manager.poll_status_once();
                tokio::select! {
                    _ = tokio::time::sleep(manager.config.status_poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("big segment status poller exiting");
                            return;
                        }
                    }
                }
            }
        });
        *self.poller.lock() = Some(task);
    }

    /// Idempotent: signals the poller, waits for it to exit with a
    /// bounded join, then releases the wrapped store.
    pub async fn stop(&self) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.poller.lock().take();
        if let Some(task) = task {
            drain_worker("big-segment-status-poller", task).await;
        }
        self.store.stop();
        self.broadcaster.shutdown().await;
    }

    fn poll_status_once(&self) -> BigSegmentStoreStatus {
        let status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata),
            },
            Err(error) => {
                warn!(%error, "big segment store metadata query failed");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };

        let changed = {
            let mut current = self.status.lock();
            let changed = *current != Some(status);
            *current = Some(status);
            changed
        };
        if changed {
            self.broadcaster.broadcast(status);
        }
        status
    }

    fn is_stale(&self, metadata: StoreMetadata) -> bool {
        let last = match metadata.last_up_to_date {
            Some(millis) => millis,
            None => return true,
        };
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        now_millis.saturating_sub(last) > self.config.stale_after.as_millis() as u64
    }

    fn status_of_result(&self) -> BigSegmentsStatus {
        let status = self.status();
        if !status.available {
            BigSegmentsStatus::StoreError
        } else if status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        }
    }
}

impl MembershipResolver for BigSegmentStoreManager {
    fn query_membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        let hash = hash_for_context_key(context_key);

        {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&hash) {
                if cached.fetched_at.elapsed() < self.config.context_cache_time {
                    return (cached.membership.clone(), self.status_of_result());
                }
                cache.pop(&hash);
            }
        }

        match self.store.get_membership(&hash) {
            Ok(membership) => {
                let membership = membership.map(Arc::new);
                self.cache.lock().put(
                    hash,
                    CachedMembership {
                        membership: membership.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                (membership, self.status_of_result())
            }
            Err(error) => {
                warn!(%error, "big segment membership query failed");
                // do not poison the cache with the failure
                (None, BigSegmentsStatus::StoreError)
            }
        }
    }
}

/// `base64(SHA-256(context_key))`, the storage key for memberships.
pub fn hash_for_context_key(context_key: &str) -> String {
    base64::encode(Sha256::digest(context_key.as_bytes()))
}
