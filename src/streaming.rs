//! Streaming transport: a long-lived SSE session per connection,
//! decoded into protocol events and reduced to change-sets.
//!
//! The reader task reconnects with exponential backoff on recoverable
//! failures, reads the response headers on every connect (environment
//! id, v1-fallback directive), and forwards updates in protocol order
//! through a bounded channel.

use crate::changeset::{EventSession, Selector, SessionOutcome};
use crate::config::Config;
use crate::datasystem::{DataSourceState, ErrorInfo, SyncSession, Synchronizer, Update};
use crate::sse;
use crate::transport::{
    base_request, is_recoverable_status, new_https_client, read_directives, Backoff,
    HEALTHY_CONNECTION_AGE,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct StreamingSynchronizer {
    config: Arc<Config>,
}

impl StreamingSynchronizer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Synchronizer for StreamingSynchronizer {
    fn name(&self) -> &'static str {
        "streaming-fdv2"
    }

    fn sync(self: Box<Self>, selector: Option<Selector>) -> SyncSession {
        let (tx, mut rx) = mpsc::channel::<Update>(16);
        let task = tokio::spawn(run_stream(self.config, selector, tx));
        SyncSession {
            updates: Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))),
            task: Some(task),
        }
    }
}

/// What one decoded SSE event means for the session.
enum StreamStep {
    /// Nothing to report.
    Continue,
    /// Forward this update.
    Emit(Update),
    /// Drop the connection and reconnect.
    Reconnect,
}

fn handle_stream_event(
    session: &mut EventSession,
    event: &sse::Event,
    environment_id: &Option<String>,
) -> StreamStep {
    match session.handle_event(&event.event_type, &event.data) {
        SessionOutcome::Continue => StreamStep::Continue,
        SessionOutcome::Completed(change_set) => {
            StreamStep::Emit(Update::valid(change_set, environment_id.clone()))
        }
        SessionOutcome::Interrupted(error) => StreamStep::Emit(Update::interrupted(
            ErrorInfo::invalid_data(error.to_string()),
            environment_id.clone(),
        )),
        SessionOutcome::Goodbye { catastrophe } => {
            if catastrophe {
                warn!("server sent a catastrophic goodbye");
            } else {
                debug!("server announced disconnect");
            }
            StreamStep::Reconnect
        }
    }
}

async fn run_stream(config: Arc<Config>, selector: Option<Selector>, tx: mpsc::Sender<Update>) {
    let client = new_https_client();
    let mut backoff = Backoff::new(config.initial_reconnect_delay);
    let mut selector = selector;
    let mut environment_id: Option<String> = None;

    'connect: loop {
        if tx.is_closed() {
            return;
        }

        let uri = config.streaming_endpoint(selector.as_ref().map(|s| s.state.as_str()));
        let request = match base_request(&config, &uri) {
            Ok(request) => request,
            Err(error) => {
                // unusable configuration cannot be retried away
                let _ = tx
                    .send(Update::off(ErrorInfo::network(error.to_string()), None))
                    .await;
                return;
            }
        };

        let response =
            match tokio::time::timeout(config.connect_timeout, client.request(request)).await {
                Err(_) => {
                    if !emit(&tx, Update::interrupted(
                        ErrorInfo::network("connect timed out".to_string()),
                        environment_id.clone(),
                    ))
                    .await
                    {
                        return;
                    }
                    if !sleep_backoff(&tx, &mut backoff).await {
                        return;
                    }
                    continue;
                }
                Ok(Err(error)) => {
                    if !emit(&tx, Update::interrupted(
                        ErrorInfo::network(error.to_string()),
                        environment_id.clone(),
                    ))
                    .await
                    {
                        return;
                    }
                    if !sleep_backoff(&tx, &mut backoff).await {
                        return;
                    }
                    continue;
                }
                Ok(Ok(response)) => response,
            };

        let status = response.status().as_u16();
        let directives = read_directives(response.headers());
        if directives.environment_id.is_some() {
            environment_id = directives.environment_id.clone();
        }
        if directives.revert_to_fdv1 {
            info!("stream response requested v1 fallback");
            let mut update = Update::interrupted(
                ErrorInfo::invalid_data("server requested v1 fallback".to_string()),
                environment_id.clone(),
            );
            update.revert_to_fdv1 = true;
            let _ = tx.send(update).await;
            return;
        }

        if !(200..300).contains(&status) {
            if is_recoverable_status(status) {
                if !emit(&tx, Update::interrupted(ErrorInfo::response(status), environment_id.clone()))
                    .await
                {
                    return;
                }
                if !sleep_backoff(&tx, &mut backoff).await {
                    return;
                }
                continue;
            }
            let _ = tx
                .send(Update::off(ErrorInfo::response(status), environment_id.clone()))
                .await;
            return;
        }

        info!("stream connected");
        let connected_at = Instant::now();
        let mut decoder = sse::Decoder::new();
        let mut session = EventSession::new();
        let mut body = response.into_body();

        loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    for event in decoder.decode(&chunk) {
                        match handle_stream_event(&mut session, &event, &environment_id) {
                            StreamStep::Continue => {}
                            StreamStep::Emit(update) => {
                                if update.state == DataSourceState::Valid {
                                    if let Some(change_set) = &update.change_set {
                                        if let Some(next) = &change_set.selector {
                                            selector = Some(next.clone());
                                        }
                                    }
                                }
                                if !emit(&tx, update).await {
                                    return;
                                }
                            }
                            StreamStep::Reconnect => {
                                if connected_at.elapsed() >= HEALTHY_CONNECTION_AGE {
                                    backoff.reset();
                                }
                                if !sleep_backoff(&tx, &mut backoff).await {
                                    return;
                                }
                                continue 'connect;
                            }
                        }
                    }
                }
                Some(Err(error)) => {
                    if !emit(&tx, Update::interrupted(
                        ErrorInfo::network(error.to_string()),
                        environment_id.clone(),
                    ))
                    .await
                    {
                        return;
                    }
                    break;
                }
                None => {
                    debug!("stream closed by server");
                    break;
                }
            }
        }

        if connected_at.elapsed() >= HEALTHY_CONNECTION_AGE {
            backoff.reset();
        }
        if !sleep_backoff(&tx, &mut backoff).await {
            return;
        }
    }
}

/// `false` means the consumer is gone and the task should exit.
async fn emit(tx: &mpsc::Sender<Update>, update: Update) -> bool {
    tx.send(update).await.is_ok()
}

async fn sleep_backoff(tx: &mpsc::Sender<Update>, backoff: &mut Backoff) -> bool {
    let delay = backoff.next_delay();
    debug!(?delay, "reconnecting after delay");
    tokio::select! {
        _ = tx.closed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::IntentCode;
    use serde_json::json;

    fn event(event_type: &str, data: serde_json::Value) -> sse::Event {
        sse::Event {
            event_type: event_type.to_string(),
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn full_session_emits_valid_update() {
        let mut session = EventSession::new();
        let env = Some("env-7".to_string());

        let step = handle_stream_event(
            &mut session,
            &event(
                "server-intent",
                json!({"payloads": [{"id": "p", "intentCode": "xfer-changes"}]}),
            ),
            &env,
        );
        assert!(matches!(step, StreamStep::Continue));

        let step = handle_stream_event(
            &mut session,
            &event(
                "put-object",
                json!({"kind": "flag", "key": "f", "version": 1,
                       "object": {"key": "f", "version": 1}}),
            ),
            &env,
        );
        assert!(matches!(step, StreamStep::Continue));

        let step = handle_stream_event(
            &mut session,
            &event("payload-transferred", json!({"state": "s1", "version": 1})),
            &env,
        );
        match step {
            StreamStep::Emit(update) => {
                assert_eq!(update.state, DataSourceState::Valid);
                assert_eq!(update.environment_id.as_deref(), Some("env-7"));
                let change_set = update.change_set.unwrap();
                assert_eq!(change_set.intent_code, Some(IntentCode::TransferChanges));
                assert_eq!(change_set.changes.len(), 1);
            }
            _ => panic!("expected an update"),
        }
    }

    #[test]
    fn protocol_fault_emits_interrupted() {
        let mut session = EventSession::new();
        let step = handle_stream_event(
            &mut session,
            &event("put-object", json!({"kind": "flag", "key": "f", "version": 1, "object": {}})),
            &None,
        );
        match step {
            StreamStep::Emit(update) => {
                assert_eq!(update.state, DataSourceState::Interrupted);
                assert!(update.error.is_some());
            }
            _ => panic!("expected an update"),
        }
    }

    #[test]
    fn goodbye_forces_reconnect_and_heartbeat_does_not() {
        let mut session = EventSession::new();
        assert!(matches!(
            handle_stream_event(&mut session, &event("heartbeat", json!({})), &None),
            StreamStep::Continue
        ));
        assert!(matches!(
            handle_stream_event(
                &mut session,
                &event("goodbye", json!({"reason": "shutting down", "catastrophe": false})),
                &None
            ),
            StreamStep::Reconnect
        ));
    }

    #[tokio::test]
    async fn unroutable_endpoint_reports_interrupted_updates() {
        let config = Arc::new(
            Config::builder("sdk-key")
                .stream_uri("http://127.0.0.1:9")
                .connect_timeout(std::time::Duration::from_millis(100))
                .initial_reconnect_delay(std::time::Duration::from_millis(10))
                .build(),
        );
        let synchronizer = Box::new(StreamingSynchronizer::new(config));
        let mut session = synchronizer.sync(None);
        let update = tokio::time::timeout(std::time::Duration::from_secs(5), session.updates.next())
            .await
            .expect("timed out waiting for update")
            .expect("stream ended unexpectedly");
        assert_eq!(update.state, DataSourceState::Interrupted);
        assert!(update.error.is_some());
    }
}
