//! Polling transport: one-shot fetches (initializer role) and interval
//! polling (synchronizer role) over both wire protocol versions.
//!
//! Both roles share a [PollRequester]: it tags the request with the
//! last known selector, inspects the response headers (including the
//! v1-fallback directive, which is honored even on error responses),
//! and hands the body to the shared change-set codec.

use crate::changeset::{changeset_from_v1, ChangeSet, EventSession, ParseError, Selector, SessionOutcome};
use crate::config::Config;
use crate::datasystem::{Basis, ErrorInfo, Initializer, SyncSession, Synchronizer, Update};
use crate::transport::{
    base_request, is_recoverable_status, new_https_client, read_directives, HttpsClient,
    TransportError, WireDirectives,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireVersion {
    V1,
    V2,
}

pub struct PollResponse {
    pub status: u16,
    pub body: Bytes,
    pub directives: WireDirectives,
}

/// Sends one poll request and returns the raw outcome.
pub struct PollRequester {
    client: HttpsClient,
    config: Arc<Config>,
    version: WireVersion,
}

impl PollRequester {
    pub fn new(config: Arc<Config>, version: WireVersion) -> Self {
        Self {
            client: new_https_client(),
            config,
            version,
        }
    }

    pub async fn request(
        &self,
        selector: Option<&Selector>,
    ) -> Result<PollResponse, TransportError> {
        let uri = match self.version {
            WireVersion::V2 => self
                .config
                .polling_endpoint(selector.map(|s| s.state.as_str())),
            WireVersion::V1 => self.config.polling_v1_endpoint(),
        };
        let request = base_request(&self.config, &uri)?;

        let response = tokio::time::timeout(self.config.connect_timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let status = response.status().as_u16();
        let directives = read_directives(response.headers());
        let body = tokio::time::timeout(
            self.config.response_timeout,
            hyper::body::to_bytes(response.into_body()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(PollResponse {
            status,
            body,
            directives,
        })
    }
}

// -- v2 polling payload ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PollingEventsPayload {
    events: Vec<PollingEvent>,
}

#[derive(Debug, Deserialize)]
struct PollingEvent {
    #[serde(rename = "event")]
    name: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A v2 polling body is the same named events as streaming, in
/// sequence; the three envelopes must appear in protocol order.
pub(crate) fn changeset_from_v2(body: &[u8]) -> Result<ChangeSet, ParseError> {
    let payload: PollingEventsPayload =
        serde_json::from_slice(body).map_err(|source| ParseError::InvalidJson {
            event: "v2 polling payload".to_string(),
            source,
        })?;

    let mut session = EventSession::new();
    let mut completed = None;
    for event in payload.events {
        match session.handle_event(&event.name, &event.data.to_string()) {
            SessionOutcome::Continue => {}
            SessionOutcome::Completed(change_set) => completed = Some(change_set),
            SessionOutcome::Interrupted(error) => return Err(error),
            SessionOutcome::Goodbye { .. } => {}
        }
    }
    completed.ok_or(ParseError::Incomplete)
}

fn parse_body(version: WireVersion, body: &[u8]) -> Result<ChangeSet, ParseError> {
    match version {
        WireVersion::V2 => changeset_from_v2(body),
        WireVersion::V1 => changeset_from_v1(body),
    }
}

/// Interpretation of one poll exchange, before header directives are
/// taken into account.
enum PollOutcome {
    ChangeSet(ChangeSet),
    Failed { error: ErrorInfo, recoverable: bool },
}

fn interpret_response(version: WireVersion, response: &PollResponse) -> PollOutcome {
    if !(200..300).contains(&response.status) {
        return PollOutcome::Failed {
            error: ErrorInfo::response(response.status),
            recoverable: is_recoverable_status(response.status),
        };
    }
    match parse_body(version, &response.body) {
        Ok(change_set) => PollOutcome::ChangeSet(change_set),
        // malformed payloads are transient: the next poll may be fine
        Err(error) => PollOutcome::Failed {
            error: ErrorInfo::invalid_data(error.to_string()),
            recoverable: true,
        },
    }
}

// -- initializer role --------------------------------------------------------

/// One-shot fetch producing the initial basis.
pub struct PollingInitializer {
    requester: PollRequester,
}

impl PollingInitializer {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            requester: PollRequester::new(config, WireVersion::V2),
        }
    }
}

impl Initializer for PollingInitializer {
    fn name(&self) -> &'static str {
        "polling-initializer"
    }

    fn fetch(&mut self) -> BoxFuture<'_, Result<Basis, ErrorInfo>> {
        Box::pin(async move {
            let response = self
                .requester
                .request(None)
                .await
                .map_err(|e| ErrorInfo::network(e.to_string()))?;
            match interpret_response(WireVersion::V2, &response) {
                PollOutcome::ChangeSet(change_set) => Ok(Basis {
                    change_set,
                    environment_id: response.directives.environment_id,
                }),
                PollOutcome::Failed { error, .. } => Err(error),
            }
        })
    }
}

// -- synchronizer role -------------------------------------------------------

/// Interval poller yielding one update per exchange.
pub struct PollingSynchronizer {
    requester: PollRequester,
    version: WireVersion,
    name: &'static str,
}

impl PollingSynchronizer {
    pub fn fdv2(config: Arc<Config>) -> Self {
        Self {
            requester: PollRequester::new(config, WireVersion::V2),
            version: WireVersion::V2,
            name: "polling-fdv2",
        }
    }

    pub fn fdv1(config: Arc<Config>) -> Self {
        Self {
            requester: PollRequester::new(config, WireVersion::V1),
            version: WireVersion::V1,
            name: "polling-fdv1",
        }
    }
}

impl Synchronizer for PollingSynchronizer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sync(self: Box<Self>, selector: Option<Selector>) -> SyncSession {
        let (tx, mut rx) = mpsc::channel::<Update>(16);
        let task = tokio::spawn(async move {
            let interval = self.requester.config.poll_interval;
            let mut selector = selector;
            loop {
                let update = match self.requester.request(selector.as_ref()).await {
                    Err(transport_error) => {
                        warn!(error = %transport_error, "poll request failed");
                        Some(Update::interrupted(
                            ErrorInfo::network(transport_error.to_string()),
                            None,
                        ))
                    }
                    Ok(response) => {
                        let environment_id = response.directives.environment_id.clone();
                        if response.directives.revert_to_fdv1 && self.version == WireVersion::V2 {
                            let mut update = Update::interrupted(
                                ErrorInfo::invalid_data(
                                    "server requested v1 fallback".to_string(),
                                ),
                                environment_id,
                            );
                            update.revert_to_fdv1 = true;
                            let _ = tx.send(update).await;
                            return;
                        }
                        match interpret_response(self.version, &response) {
                            PollOutcome::ChangeSet(change_set) => {
                                if let Some(next) = &change_set.selector {
                                    selector = Some(next.clone());
                                }
                                debug!(changes = change_set.changes.len(), "poll delivered data");
                                Some(Update::valid(change_set, environment_id))
                            }
                            PollOutcome::Failed { error, recoverable } => {
                                if recoverable {
                                    Some(Update::interrupted(error, environment_id))
                                } else {
                                    let _ = tx.send(Update::off(error, environment_id)).await;
                                    return;
                                }
                            }
                        }
                    }
                };
                if let Some(update) = update {
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        SyncSession {
            updates: Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))),
            task: Some(task),
        }
    }
}
