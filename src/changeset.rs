//! Wire-neutral configuration deltas and the fdv2 event protocol.
//!
//! Both transports (streaming SSE and polling) deliver the same named
//! events; [EventSession] consumes them in protocol order and produces
//! [ChangeSet]s, which are the only form the rest of the data system
//! ever applies. Legacy v1 polling payloads are translated into a
//! synthetic full-transfer change-set at this boundary.

use crate::models::{Flag, Segment};
use crate::store::{DataKind, StoreItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{trace, warn};

pub const EVENT_SERVER_INTENT: &str = "server-intent";
pub const EVENT_PUT_OBJECT: &str = "put-object";
pub const EVENT_DELETE_OBJECT: &str = "delete-object";
pub const EVENT_PAYLOAD_TRANSFERRED: &str = "payload-transferred";
pub const EVENT_GOODBYE: &str = "goodbye";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// What the server intends to send for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum IntentCode {
    #[serde(rename = "none")]
    TransferNone,
    #[serde(rename = "xfer-full")]
    TransferFull,
    #[serde(rename = "xfer-changes")]
    TransferChanges,
}

/// Opaque resume token: presented on the next request so the server can
/// reply with only what changed (or nothing).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Selector {
    pub state: String,
    pub version: u64,
}

#[derive(Clone, Debug)]
pub enum ChangeAction {
    Put(StoreItem),
    Delete,
}

/// One item-level mutation within a change-set.
#[derive(Clone, Debug)]
pub struct Change {
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
    pub action: ChangeAction,
}

/// An ordered batch of puts/deletes with an intent code and an optional
/// resume selector.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub intent_code: Option<IntentCode>,
    pub changes: Vec<Change>,
    pub selector: Option<Selector>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to parse {event} event payload: {source}")]
    InvalidJson {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{event} event arrived before server-intent")]
    OutOfOrder { event: String },

    #[error("server-intent carried no payloads")]
    EmptyIntent,

    #[error("malformed {kind} object {key:?}: {source}")]
    MalformedObject {
        kind: DataKind,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} item {1:?} has no version")]
    MissingVersion(&'static str, String),

    #[error("server reported an error for the in-flight payload: {0}")]
    PayloadError(String),

    #[error("payload ended without payload-transferred")]
    Incomplete,
}

// -- wire event payload schemas ---------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerIntentData {
    payloads: Vec<PayloadIntent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadIntent {
    #[serde(default)]
    id: String,
    intent_code: IntentCode,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutObjectData {
    kind: String,
    key: String,
    version: u64,
    object: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteObjectData {
    kind: String,
    key: String,
    version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadTransferredData {
    state: String,
    version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoodbyeData {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    catastrophe: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorData {
    #[serde(default)]
    payload_id: String,
    #[serde(default)]
    reason: String,
}

fn parse_kind(kind: &str) -> Option<DataKind> {
    match kind {
        "flag" => Some(DataKind::Flag),
        "segment" => Some(DataKind::Segment),
        _ => None,
    }
}

/// Parse a wire object into the normalized model, stamping the envelope
/// key and version over whatever the body carried.
fn parse_object(
    kind: DataKind,
    key: &str,
    version: u64,
    object: Value,
) -> Result<StoreItem, ParseError> {
    let malformed = |source| ParseError::MalformedObject {
        kind,
        key: key.to_string(),
        source,
    };
    match kind {
        DataKind::Flag => {
            let mut flag: Flag = serde_json::from_value(object).map_err(malformed)?;
            flag.key = key.to_string();
            flag.version = version;
            Ok(flag.into())
        }
        DataKind::Segment => {
            let mut segment: Segment = serde_json::from_value(object).map_err(malformed)?;
            segment.key = key.to_string();
            segment.version = version;
            Ok(segment.into())
        }
    }
}

// -- builder ---------------------------------------------------------------

/// Accumulates changes between `server-intent` and
/// `payload-transferred`, preserving order.
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    intent: Option<IntentCode>,
    changes: Vec<Change>,
}

impl ChangeSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.intent.is_some()
    }

    pub fn start(&mut self, intent: IntentCode) {
        if self.intent.is_some() {
            warn!("server-intent received mid-transfer, restarting change-set");
        }
        self.intent = Some(intent);
        self.changes.clear();
    }

    pub fn add_put(
        &mut self,
        kind: DataKind,
        key: String,
        version: u64,
        item: StoreItem,
    ) -> Result<(), ParseError> {
        if self.intent.is_none() {
            return Err(ParseError::OutOfOrder {
                event: EVENT_PUT_OBJECT.to_string(),
            });
        }
        self.changes.push(Change {
            kind,
            key,
            version,
            action: ChangeAction::Put(item),
        });
        Ok(())
    }

    pub fn add_delete(&mut self, kind: DataKind, key: String, version: u64) -> Result<(), ParseError> {
        if self.intent.is_none() {
            return Err(ParseError::OutOfOrder {
                event: EVENT_DELETE_OBJECT.to_string(),
            });
        }
        self.changes.push(Change {
            kind,
            key,
            version,
            action: ChangeAction::Delete,
        });
        Ok(())
    }

    pub fn finish(&mut self, selector: Option<Selector>) -> Result<ChangeSet, ParseError> {
        let intent = self.intent.take().ok_or(ParseError::OutOfOrder {
            event: EVENT_PAYLOAD_TRANSFERRED.to_string(),
        })?;
        let changes = if intent == IntentCode::TransferNone {
            self.changes.clear();
            Vec::new()
        } else {
            std::mem::take(&mut self.changes)
        };
        Ok(ChangeSet {
            intent_code: Some(intent),
            changes,
            selector,
        })
    }

    pub fn reset(&mut self) {
        self.intent = None;
        self.changes.clear();
    }
}

// -- session state machine --------------------------------------------------

/// Result of absorbing one protocol event.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Event absorbed (or ignored); nothing to report yet.
    Continue,
    /// `payload-transferred` completed a change-set.
    Completed(ChangeSet),
    /// Protocol fault: the in-flight change-set was discarded and the
    /// session returned to idle.
    Interrupted(ParseError),
    /// The server announced it will drop the connection.
    Goodbye { catastrophe: bool },
}

/// Per-session consumer of named protocol events, shared by the
/// streaming reader and the v2 polling codec.
#[derive(Debug, Default)]
pub struct EventSession {
    builder: ChangeSetBuilder,
}

impl EventSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one named event with its raw JSON payload.
    pub fn handle_event(&mut self, name: &str, data: &str) -> SessionOutcome {
        trace!(%name, "processing protocol event");
        match name {
            EVENT_SERVER_INTENT => self.on_server_intent(data),
            EVENT_PUT_OBJECT => self.interruptible(data, Self::on_put_object),
            EVENT_DELETE_OBJECT => self.interruptible(data, Self::on_delete_object),
            EVENT_PAYLOAD_TRANSFERRED => self.on_payload_transferred(data),
            EVENT_GOODBYE => self.on_goodbye(data),
            EVENT_ERROR => self.on_error(data),
            EVENT_HEARTBEAT => SessionOutcome::Continue,
            _ => {
                trace!(%name, "ignoring unknown event type");
                SessionOutcome::Continue
            }
        }
    }

    fn interruptible(
        &mut self,
        data: &str,
        handle: impl FnOnce(&mut Self, &str) -> Result<(), ParseError>,
    ) -> SessionOutcome {
        match handle(self, data) {
            Ok(()) => SessionOutcome::Continue,
            Err(error) => {
                self.builder.reset();
                SessionOutcome::Interrupted(error)
            }
        }
    }

    fn on_server_intent(&mut self, data: &str) -> SessionOutcome {
        let parsed: Result<ServerIntentData, _> = serde_json::from_str(data);
        match parsed {
            Ok(intent) => match intent.payloads.into_iter().next() {
                Some(payload) => {
                    if let Some(reason) = &payload.reason {
                        trace!(id = %payload.id, %reason, "server intent");
                    }
                    self.builder.start(payload.intent_code);
                    SessionOutcome::Continue
                }
                None => {
                    self.builder.reset();
                    SessionOutcome::Interrupted(ParseError::EmptyIntent)
                }
            },
            Err(source) => {
                self.builder.reset();
                SessionOutcome::Interrupted(ParseError::InvalidJson {
                    event: EVENT_SERVER_INTENT.to_string(),
                    source,
                })
            }
        }
    }

    fn on_put_object(&mut self, data: &str) -> Result<(), ParseError> {
        let put: PutObjectData = serde_json::from_str(data).map_err(|source| ParseError::InvalidJson {
            event: EVENT_PUT_OBJECT.to_string(),
            source,
        })?;
        let kind = match parse_kind(&put.kind) {
            Some(kind) => kind,
            None => {
                warn!(kind = %put.kind, key = %put.key, "ignoring object of unknown kind");
                return Ok(());
            }
        };
        let item = parse_object(kind, &put.key, put.version, put.object)?;
        self.builder.add_put(kind, put.key, put.version, item)
    }

    fn on_delete_object(&mut self, data: &str) -> Result<(), ParseError> {
        let delete: DeleteObjectData =
            serde_json::from_str(data).map_err(|source| ParseError::InvalidJson {
                event: EVENT_DELETE_OBJECT.to_string(),
                source,
            })?;
        let kind = match parse_kind(&delete.kind) {
            Some(kind) => kind,
            None => {
                warn!(kind = %delete.kind, key = %delete.key, "ignoring delete of unknown kind");
                return Ok(());
            }
        };
        self.builder.add_delete(kind, delete.key, delete.version)
    }

    fn on_payload_transferred(&mut self, data: &str) -> SessionOutcome {
        let parsed: Result<PayloadTransferredData, _> = serde_json::from_str(data);
        match parsed {
            Ok(transferred) => {
                let selector = Selector {
                    state: transferred.state,
                    version: transferred.version,
                };
                match self.builder.finish(Some(selector)) {
                    Ok(change_set) => SessionOutcome::Completed(change_set),
                    Err(error) => {
                        self.builder.reset();
                        SessionOutcome::Interrupted(error)
                    }
                }
            }
            Err(source) => {
                self.builder.reset();
                SessionOutcome::Interrupted(ParseError::InvalidJson {
                    event: EVENT_PAYLOAD_TRANSFERRED.to_string(),
                    source,
                })
            }
        }
    }

    fn on_goodbye(&mut self, data: &str) -> SessionOutcome {
        let goodbye: GoodbyeData = serde_json::from_str(data).unwrap_or(GoodbyeData {
            reason: String::new(),
            catastrophe: false,
        });
        if !goodbye.reason.is_empty() {
            trace!(reason = %goodbye.reason, "server said goodbye");
        }
        SessionOutcome::Goodbye {
            catastrophe: goodbye.catastrophe,
        }
    }

    fn on_error(&mut self, data: &str) -> SessionOutcome {
        let error: ErrorData = serde_json::from_str(data).unwrap_or(ErrorData {
            payload_id: String::new(),
            reason: "unparseable error event".to_string(),
        });
        warn!(payload_id = %error.payload_id, reason = %error.reason,
              "server reported a payload error");
        self.builder.reset();
        SessionOutcome::Interrupted(ParseError::PayloadError(error.reason))
    }
}

// -- v1 translation ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct V1AllPayload {
    #[serde(default)]
    flags: HashMap<String, Value>,
    #[serde(default)]
    segments: HashMap<String, Value>,
}

/// Translate a v1 `{"flags":{...},"segments":{...}}` payload into a
/// synthetic full transfer with no selector.
///
/// Every item must carry a version; `deleted: true` items become delete
/// changes so their tombstones survive the init diff.
pub fn changeset_from_v1(body: &[u8]) -> Result<ChangeSet, ParseError> {
    let payload: V1AllPayload =
        serde_json::from_slice(body).map_err(|source| ParseError::InvalidJson {
            event: "v1 polling payload".to_string(),
            source,
        })?;

    let mut changes = Vec::with_capacity(payload.flags.len() + payload.segments.len());
    // stable order so repeated polls diff cleanly
    let mut translate = |kind: DataKind,
                         kind_name: &'static str,
                         items: HashMap<String, Value>|
     -> Result<(), ParseError> {
        let mut entries: Vec<(String, Value)> = items.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, object) in entries {
            let version = object
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| ParseError::MissingVersion(kind_name, key.clone()))?;
            let deleted = object
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if deleted {
                changes.push(Change {
                    kind,
                    key,
                    version,
                    action: ChangeAction::Delete,
                });
            } else {
                let item = parse_object(kind, &key, version, object)?;
                changes.push(Change {
                    kind,
                    key,
                    version,
                    action: ChangeAction::Put(item),
                });
            }
        }
        Ok(())
    };
    translate(DataKind::Segment, "segment", payload.segments)?;
    translate(DataKind::Flag, "flag", payload.flags)?;

    Ok(ChangeSet {
        intent_code: Some(IntentCode::TransferFull),
        changes,
        selector: None,
    })
}
