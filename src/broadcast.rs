//! Listener registration and asynchronous event fan-out.
//!
//! One [Broadcaster] exists per event family (flag changes, data-source
//! status, data-store status, big-segments status). Dispatch happens on
//! a single bounded-queue worker per broadcaster, which gives every
//! listener the same FIFO view of the event sequence; when the queue is
//! full the event is dropped with a warning rather than blocking the
//! producer.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::context::Context;

const DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// Something that can receive events of one family.
///
/// Any `Fn(&E)` qualifies; the trait bound is what guarantees at
/// registration time that a listener can actually be delivered to.
pub trait Listener<E>: Send + Sync {
    fn deliver(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn deliver(&self, event: &E) {
        self(event)
    }
}

/// Token for unregistering a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// Fan-out of one event family to any number of listeners.
pub struct Broadcaster<E> {
    listeners: Arc<RwLock<HashMap<u64, Arc<dyn Listener<E>>>>>,
    next_id: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<E>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    // names the event family in logs
    label: &'static str,
}

impl<E: Send + 'static> Broadcaster<E> {
    pub fn new(label: &'static str) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            sender: Mutex::new(None),
            dispatcher: Mutex::new(None),
            stopped: AtomicBool::new(false),
            label,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<E>>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, listener);
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.write().remove(&handle.0);
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    /// Queue an event for delivery to all current listeners.
    ///
    /// Must be called from within a tokio runtime (the dispatch worker
    /// is spawned on first use). Never blocks: a full queue drops the
    /// event with a warning, and events broadcast after `shutdown` are
    /// discarded.
    pub fn broadcast(&self, event: E) {
        if self.stopped.load(Ordering::SeqCst) || !self.has_listeners() {
            return;
        }
        let mut guard = self.sender.lock();
        // re-check under the lock: shutdown flips the flag before it
        // takes the sender, so no dispatcher can be spawned after it
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let sender = match guard.as_ref() {
            Some(sender) if !sender.is_closed() => sender,
            _ => {
                let (sender, receiver) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
                let task =
                    Self::spawn_dispatcher(self.label, Arc::clone(&self.listeners), receiver);
                *self.dispatcher.lock() = Some(task);
                *guard = Some(sender);
                guard.as_ref().unwrap()
            }
        };
        if sender.try_send(event).is_err() {
            warn!(family = self.label, "event queue full, dropping notification");
        }
    }

    fn spawn_dispatcher(
        label: &'static str,
        listeners: Arc<RwLock<HashMap<u64, Arc<dyn Listener<E>>>>>,
        mut receiver: mpsc::Receiver<E>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let current: Vec<Arc<dyn Listener<E>>> =
                    listeners.read().values().cloned().collect();
                for listener in current {
                    // a panicking listener must not affect its siblings
                    let result = catch_unwind(AssertUnwindSafe(|| listener.deliver(&event)));
                    if result.is_err() {
                        error!(family = label, "listener panicked while handling event");
                    }
                }
            }
        })
    }

    /// Stop dispatch permanently: the queue is closed, already-queued
    /// events are drained with a bounded join, and any later broadcast
    /// is discarded. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        let task = self.dispatcher.lock().take();
        if let Some(task) = task {
            drain_worker(self.label, task).await;
        }
    }
}

/// How long a `stop`/`shutdown` waits for a worker before aborting it.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded join used by every `stop` in the crate: waits for the task
/// to finish on its own, then aborts it rather than hang the caller.
pub(crate) async fn drain_worker(name: &'static str, mut task: JoinHandle<()>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                error!(worker = name, "worker panicked before shutdown");
            }
        }
        Err(_) => {
            warn!(worker = name, "worker did not drain in time, aborting it");
            task.abort();
        }
    }
}

/// A flag's evaluation inputs may have changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagChange {
    pub key: String,
}

/// An observed transition of one flag's value for a fixed context.
#[derive(Clone, Debug, PartialEq)]
pub struct FlagValueChange {
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Adapter turning coarse [FlagChange] events into [FlagValueChange]
/// events for one (flag, context) pair: the flag is re-evaluated on each
/// change notification and the wrapped listener only hears about actual
/// value transitions.
pub struct FlagValueChangeListener<F> {
    flag_key: String,
    context: Context,
    eval_fn: F,
    last_value: Mutex<Value>,
    inner: Arc<dyn Listener<FlagValueChange>>,
}

impl<F> FlagValueChangeListener<F>
where
    F: Fn(&str, &Context) -> Value + Send + Sync,
{
    pub fn new(
        flag_key: String,
        context: Context,
        eval_fn: F,
        inner: Arc<dyn Listener<FlagValueChange>>,
    ) -> Self {
        let initial = eval_fn(&flag_key, &context);
        Self {
            flag_key,
            context,
            eval_fn,
            last_value: Mutex::new(initial),
            inner,
        }
    }
}

impl<F> Listener<FlagChange> for FlagValueChangeListener<F>
where
    F: Fn(&str, &Context) -> Value + Send + Sync,
{
    fn deliver(&self, event: &FlagChange) {
        if event.key != self.flag_key {
            return;
        }
        let new_value = (self.eval_fn)(&self.flag_key, &self.context);
        let old_value = {
            let mut last = self.last_value.lock();
            if *last == new_value {
                return;
            }
            std::mem::replace(&mut *last, new_value.clone())
        };
        self.inner.deliver(&FlagValueChange {
            key: self.flag_key.clone(),
            old_value,
            new_value,
        });
    }
}
