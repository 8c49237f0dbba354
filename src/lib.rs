//! Server-side feature flag core: a two-phase data system over the
//! fdv2 wire protocols, a pure evaluation engine, and change
//! propagation through dependency tracking.
//!
//! [Client] is the glue over the smaller building blocks: it assembles
//! the store stack, the data system and the evaluator from a [Config],
//! and exposes the idiomatic `variation` calls.

use crate::bigsegments::{BigSegmentStore, BigSegmentStoreManager, BigSegmentStoreStatus};
use crate::broadcast::{Broadcaster, FlagChange, FlagValueChange, Listener, ListenerHandle};
use crate::config::Config;
use crate::context::Context;
use crate::datasystem::{DataAvailability, DataSourceSet, DataSourceStatus, DataSystem};
use crate::detail::{ErrorKind, EvaluationDetail};
use crate::evaluator::{EvalResult, Evaluator};
use crate::polling::{PollingInitializer, PollingSynchronizer};
use crate::store::{DataKind, Store};
use crate::store_wrapper::{DataStoreStatus, PersistenceMode, PersistentStore, StoreWrapper};
use crate::streaming::StreamingSynchronizer;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod bigsegments;
pub mod broadcast;
pub mod changeset;
pub mod config;
pub mod context;
pub mod datasystem;
pub mod dependency;
pub mod detail;
pub mod evaluator;
pub mod models;
pub mod operators;
pub mod polling;
pub mod sse;
pub mod store;
pub mod store_wrapper;
pub mod streaming;
pub mod transport;
#[cfg(test)]
mod test_utils;

pub use crate::context::{ContextBuilder, MultiContextBuilder, Reference};
pub use crate::detail::Reason;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Already started, can't start multiple times")]
    AlreadyStarted,
}

/// Assembles a [Client] from a [Config] plus the optional external
/// store collaborators.
pub struct ClientBuilder {
    config: Config,
    persistent_store: Option<Arc<dyn PersistentStore>>,
    big_segment_store: Option<Arc<dyn BigSegmentStore>>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            persistent_store: None,
            big_segment_store: None,
        }
    }

    pub fn persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent_store = Some(store);
        self
    }

    pub fn big_segment_store(mut self, store: Arc<dyn BigSegmentStore>) -> Self {
        self.big_segment_store = Some(store);
        self
    }

    pub fn build(self) -> Client {
        let config = Arc::new(self.config);

        let store = match self.persistent_store {
            Some(persistent) => {
                let mode = if config.use_ldd {
                    PersistenceMode::ReadOnly
                } else {
                    PersistenceMode::ReadWrite
                };
                StoreWrapper::with_persistent(persistent, mode)
            }
            None => StoreWrapper::new(),
        };

        let big_segments = self.big_segment_store.map(|external| {
            Arc::new(BigSegmentStoreManager::new(
                external,
                config.big_segments.clone(),
            ))
        });

        let evaluator = match &big_segments {
            Some(manager) => Arc::new(Evaluator::with_big_segments(
                store.clone(),
                Arc::clone(manager) as _,
            )),
            None => Arc::new(Evaluator::new(store.clone())),
        };

        let data_system = Arc::new(DataSystem::new(store.clone()));

        Client {
            config,
            store,
            evaluator,
            data_system,
            big_segments,
            started: AtomicBool::new(false),
        }
    }
}

/// Client providing the idiomatic way of retrieving variation values
/// for flags.
///
/// Glue code on top of the smaller building blocks.
pub struct Client {
    config: Arc<Config>,
    store: StoreWrapper,
    evaluator: Arc<Evaluator<StoreWrapper>>,
    data_system: Arc<DataSystem>,
    big_segments: Option<Arc<BigSegmentStoreManager>>,
    started: AtomicBool,
}

impl Client {
    /// Create a client from an SDK key with default configuration.
    pub fn with_sdk_key(sdk_key: &str) -> Self {
        ClientBuilder::new(Config::builder(sdk_key).build()).build()
    }

    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Start the data system in the background.
    ///
    /// The future resolves once initial data is available (or startup
    /// has terminally failed); the work continues in the background
    /// either way.
    pub async fn start(&self) -> Result<(), StartError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }
        if let Some(manager) = &self.big_segments {
            Arc::clone(manager).start_polling();
        }
        let sources = self.data_sources();
        Arc::clone(&self.data_system).start(sources);
        self.data_system.wait_ready().await;
        Ok(())
    }

    fn data_sources(&self) -> DataSourceSet {
        // offline and daemon modes make no connections of their own
        if self.config.offline || self.config.use_ldd {
            return DataSourceSet::empty();
        }
        let mut sources = DataSourceSet::empty();
        sources
            .initializers
            .push(Box::new(PollingInitializer::new(Arc::clone(&self.config))));
        if self.config.stream {
            sources.synchronizers.push(Box::new(StreamingSynchronizer::new(
                Arc::clone(&self.config),
            )));
        }
        sources
            .synchronizers
            .push(Box::new(PollingSynchronizer::fdv2(Arc::clone(&self.config))));
        sources.fdv1_fallback = Some(Box::new(PollingSynchronizer::fdv1(Arc::clone(
            &self.config,
        ))));
        sources
    }

    /// Idempotent: stops all workers, waiting for each with a bounded
    /// join, and releases the external stores.
    pub async fn stop(&self) {
        self.data_system.stop().await;
        if let Some(manager) = &self.big_segments {
            manager.stop().await;
        }
    }

    // -- evaluation ---------------------------------------------------------

    /// Full evaluation result including prerequisite records; the
    /// building block under the `variation` helpers.
    pub fn evaluate(&self, flag_key: &str, context: &Context) -> EvalResult {
        self.evaluator.evaluate_key(flag_key, context)
    }

    /// Evaluate a flag, substituting `default` on any failure.
    pub fn variation_detail(
        &self,
        flag_key: &str,
        context: &Context,
        default: Value,
    ) -> EvaluationDetail<Value> {
        if !self.store.is_initialized() {
            let mut detail = EvaluationDetail::err(ErrorKind::ClientNotReady);
            detail.value = Some(default);
            return detail;
        }
        let mut detail = self.evaluate(flag_key, context).detail;
        if detail.value.is_none() {
            detail.value = Some(default);
        }
        detail
    }

    pub fn variation(&self, flag_key: &str, context: &Context, default: Value) -> Value {
        self.variation_detail(flag_key, context, default)
            .value
            .unwrap_or(Value::Null)
    }

    pub fn bool_variation(&self, flag_key: &str, context: &Context, default: bool) -> bool {
        self.typed_variation(flag_key, context, default, |v| v.as_bool())
    }

    pub fn int_variation(&self, flag_key: &str, context: &Context, default: i64) -> i64 {
        self.typed_variation(flag_key, context, default, |v| v.as_i64())
    }

    pub fn float_variation(&self, flag_key: &str, context: &Context, default: f64) -> f64 {
        self.typed_variation(flag_key, context, default, |v| v.as_f64())
    }

    pub fn string_variation(&self, flag_key: &str, context: &Context, default: &str) -> String {
        self.typed_variation(flag_key, context, default.to_string(), |v| {
            v.as_str().map(str::to_string)
        })
    }

    fn typed_variation<T: Clone>(
        &self,
        flag_key: &str,
        context: &Context,
        default: T,
        convert: impl FnOnce(Value) -> Option<T>,
    ) -> T {
        let detail = self
            .variation_detail(flag_key, context, Value::Null)
            .try_map(
                |value| {
                    if value.is_null() {
                        Some(default.clone())
                    } else {
                        convert(value)
                    }
                },
                default.clone(),
            );
        detail.value.unwrap_or(default)
    }

    /// Keys of all flags currently in the store.
    pub fn all_flag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.all(DataKind::Flag).keys().cloned().collect();
        keys.sort();
        keys
    }

    // -- status and listeners ----------------------------------------------

    pub fn data_source_status(&self) -> DataSourceStatus {
        self.data_system.status()
    }

    pub fn data_availability(&self) -> DataAvailability {
        self.data_system.data_availability()
    }

    pub fn data_store_status(&self) -> DataStoreStatus {
        self.store.status()
    }

    pub fn big_segment_store_status(&self) -> Option<BigSegmentStoreStatus> {
        self.big_segments.as_ref().map(|manager| manager.status())
    }

    pub fn environment_id(&self) -> Option<String> {
        self.data_system.environment_id()
    }

    pub fn flag_change_broadcaster(&self) -> &Broadcaster<FlagChange> {
        self.data_system.flag_change_broadcaster()
    }

    pub fn data_source_status_broadcaster(&self) -> &Broadcaster<DataSourceStatus> {
        self.data_system.status_broadcaster()
    }

    pub fn data_store_status_broadcaster(&self) -> &Broadcaster<DataStoreStatus> {
        self.store.status_broadcaster()
    }

    /// Watch one flag's value for one context: the listener only hears
    /// about actual value transitions.
    pub fn add_flag_value_change_listener(
        &self,
        flag_key: &str,
        context: Context,
        listener: Arc<dyn Listener<FlagValueChange>>,
    ) -> ListenerHandle {
        let evaluator = Arc::clone(&self.evaluator);
        let adapter = broadcast::FlagValueChangeListener::new(
            flag_key.to_string(),
            context,
            move |key: &str, context: &Context| {
                evaluator
                    .evaluate_key(key, context)
                    .detail
                    .value
                    .unwrap_or(Value::Null)
            },
            listener,
        );
        self.flag_change_broadcaster().add_listener(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{Change, ChangeAction, ChangeSet, IntentCode};
    use crate::detail::ReasonKind;
    use crate::test_utils::FlagBuilder;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn offline_client() -> Client {
        ClientBuilder::new(Config::builder("sdk-key").offline(true).build()).build()
    }

    fn put_flag(
        client: &Client,
        key: &str,
        version: u64,
        variations: Vec<Value>,
        fallthrough: usize,
    ) {
        let flag = FlagBuilder::new(key)
            .version(version)
            .on(true)
            .variations(variations)
            .fallthrough_variation(fallthrough)
            .build();
        client
            .data_system
            .apply_change_set(&ChangeSet {
                intent_code: Some(IntentCode::TransferChanges),
                changes: vec![Change {
                    kind: DataKind::Flag,
                    key: key.to_string(),
                    version,
                    action: ChangeAction::Put(flag.into()),
                }],
                selector: None,
            })
            .unwrap();
    }

    fn user(key: &str) -> Context {
        ContextBuilder::new(key).build().unwrap()
    }

    #[tokio::test]
    async fn unready_client_serves_defaults() {
        let client = offline_client();
        let detail = client.variation_detail("f", &user("u"), json!("fallback"));
        assert_eq!(detail.value, Some(json!("fallback")));
        assert_eq!(detail.reason, Reason::error(ErrorKind::ClientNotReady));
        assert!(client.bool_variation("f", &user("u"), true));
    }

    #[tokio::test]
    async fn variations_come_from_store_data() {
        let client = offline_client();
        put_flag(&client, "greeting", 1, vec![json!("hi"), json!("hello")], 1);

        assert_eq!(
            client.string_variation("greeting", &user("u"), "default"),
            "hello"
        );
        let detail = client.variation_detail("greeting", &user("u"), json!("default"));
        assert_eq!(detail.variation_index, Some(1));
        assert!(matches!(detail.reason.kind, ReasonKind::Fallthrough { .. }));

        // unknown flags still fall back
        assert_eq!(
            client.string_variation("missing", &user("u"), "default"),
            "default"
        );
        assert_eq!(client.all_flag_keys(), vec!["greeting".to_string()]);
    }

    #[tokio::test]
    async fn typed_variations_enforce_types() {
        let client = offline_client();
        put_flag(&client, "mixed", 1, vec![json!(true), json!("text")], 1);

        // stored value is a string: the bool accessor falls back
        assert!(client.bool_variation("mixed", &user("u"), true));
        assert_eq!(client.string_variation("mixed", &user("u"), "d"), "text");
        assert_eq!(client.int_variation("mixed", &user("u"), 7), 7);

        put_flag(&client, "count", 2, vec![json!(1), json!(42)], 1);
        assert_eq!(client.int_variation("count", &user("u"), 0), 42);
        assert_eq!(client.float_variation("count", &user("u"), 0.0), 42.0);
    }

    #[tokio::test]
    async fn offline_start_resolves_immediately() {
        let client = offline_client();
        tokio::time::timeout(Duration::from_secs(5), client.start())
            .await
            .expect("start timed out")
            .expect("start failed");
        assert!(matches!(
            client.start().await,
            Err(StartError::AlreadyStarted)
        ));
        client.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn flag_value_change_listener_sees_transitions() {
        let client = offline_client();
        put_flag(&client, "watched", 1, vec![json!(false), json!(true)], 0);

        let observed = Arc::new(Mutex::new(Vec::<FlagValueChange>::new()));
        let sink = {
            let observed = Arc::clone(&observed);
            Arc::new(move |event: &FlagValueChange| observed.lock().push(event.clone()))
        };
        client.add_flag_value_change_listener("watched", user("u"), sink);

        // same value again: no notification
        put_flag(&client, "watched", 2, vec![json!(false), json!(true)], 0);
        // new fallthrough variation: the value flips
        put_flag(&client, "watched", 3, vec![json!(false), json!(true)], 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = observed.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "watched");
        assert_eq!(events[0].old_value, json!(false));
        assert_eq!(events[0].new_value, json!(true));
    }
}
