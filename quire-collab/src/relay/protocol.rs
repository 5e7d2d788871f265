//! Relay wire protocol.
//!
//! One bincode-encoded [`Frame`] per binary WebSocket message:
//! ```text
//! client                                   relay
//!   │ ── Request { id, body } ───────────────► │  store call
//!   │ ◄─────────────── Response { id, result } │
//!   │ ── Request { id, Subscribe* } ─────────► │  open watch
//!   │ ◄──────────────────── Notify(..) ─ ─ ─ ─ │  every later write
//!   │ ── Beacon { doc_id, user_id } ─────────► │  no response
//! ```
//!
//! Request ids are chosen by the client and only need to be unique per
//! connection. Notifications carry no id; they are routed by document.
//!
//! Reference: Patterson & Hennessy, Section 5.7, Data Compression

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::history::HistoryEntry;
use crate::presence::{PresenceEvent, PresenceRecord};
use crate::store::{CreateOutcome, SnapshotRecord, StoreError};

/// A store call, one variant per `RemoteStore` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetSnapshot { doc_id: Uuid },
    CreateSnapshot { doc_id: Uuid, content: String },
    PutSnapshot { doc_id: Uuid, content: String },
    /// Start forwarding snapshot writes of `doc_id` to this connection.
    SubscribeSnapshot { doc_id: Uuid },
    UpsertPresence { doc_id: Uuid, record: PresenceRecord },
    RemovePresence { doc_id: Uuid, user_id: Uuid },
    ListPresence { doc_id: Uuid },
    /// Start forwarding presence changes of `doc_id` to this connection.
    SubscribePresence { doc_id: Uuid },
    NextVersion { doc_id: Uuid },
    AppendHistory { doc_id: Uuid, entry: HistoryEntry },
    ListHistory { doc_id: Uuid },
}

impl Request {
    pub fn doc_id(&self) -> Uuid {
        match self {
            Request::GetSnapshot { doc_id }
            | Request::CreateSnapshot { doc_id, .. }
            | Request::PutSnapshot { doc_id, .. }
            | Request::SubscribeSnapshot { doc_id }
            | Request::UpsertPresence { doc_id, .. }
            | Request::RemovePresence { doc_id, .. }
            | Request::ListPresence { doc_id }
            | Request::SubscribePresence { doc_id }
            | Request::NextVersion { doc_id }
            | Request::AppendHistory { doc_id, .. }
            | Request::ListHistory { doc_id } => *doc_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetSnapshot { .. } => "get_snapshot",
            Request::CreateSnapshot { .. } => "create_snapshot",
            Request::PutSnapshot { .. } => "put_snapshot",
            Request::SubscribeSnapshot { .. } => "subscribe_snapshot",
            Request::UpsertPresence { .. } => "upsert_presence",
            Request::RemovePresence { .. } => "remove_presence",
            Request::ListPresence { .. } => "list_presence",
            Request::SubscribePresence { .. } => "subscribe_presence",
            Request::NextVersion { .. } => "next_version",
            Request::AppendHistory { .. } => "append_history",
            Request::ListHistory { .. } => "list_history",
        }
    }
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Snapshot(Option<SnapshotRecord>),
    Created(CreateOutcome),
    Written(SnapshotRecord),
    Presence(Vec<PresenceRecord>),
    Version(u64),
    History(Vec<HistoryEntry>),
    /// Requests with no payload: removals, appends, subscriptions.
    Done,
}

/// A change pushed by the relay without a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Snapshot { doc_id: Uuid, record: SnapshotRecord },
    Presence { doc_id: Uuid, event: PresenceEvent },
}

impl Notification {
    pub fn doc_id(&self) -> Uuid {
        match self {
            Notification::Snapshot { doc_id, .. } | Notification::Presence { doc_id, .. } => {
                *doc_id
            }
        }
    }
}

/// The unit of exchange on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request { id: u64, body: Request },
    Response { id: u64, result: Result<Reply, StoreError> },
    Notify(Notification),
    /// Fire-and-forget presence removal sent while the client is going away.
    Beacon { doc_id: Uuid, user_id: Uuid },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Wire format errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// A response whose payload does not match the request it answers.
    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

impl From<ProtocolError> for StoreError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::SerializationError(msg) => StoreError::SerializationError(msg),
            other => StoreError::DeserializationError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChangeType;
    use chrono::Utc;

    #[test]
    fn test_request_frame_roundtrip() {
        let doc_id = Uuid::new_v4();
        let frame = Frame::Request {
            id: 42,
            body: Request::PutSnapshot {
                doc_id,
                content: "AQID".to_string(),
            },
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_error_response_survives_the_wire() {
        let frame = Frame::Response {
            id: 7,
            result: Err(StoreError::PermissionDenied("read-only".into())),
        };
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Response { id, result } => {
                assert_eq!(id, 7);
                assert_eq!(result, Err(StoreError::PermissionDenied("read-only".into())));
            }
            other => panic!("Expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_carries_records() {
        let doc_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let frame = Frame::Notify(Notification::Presence {
            doc_id,
            event: PresenceEvent::Upserted(PresenceRecord {
                user_id,
                name: "Alice".into(),
                color: "#d93f26".into(),
                cursor: None,
                last_seen: Utc::now(),
            }),
        });
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Notify(n) => {
                assert_eq!(n.doc_id(), doc_id);
                match n {
                    Notification::Presence { event, .. } => assert_eq!(event.user_id(), user_id),
                    other => panic!("Expected presence, got {other:?}"),
                }
            }
            other => panic!("Expected Notify, got {other:?}"),
        }
    }

    #[test]
    fn test_history_reply_roundtrip() {
        let entry = HistoryEntry {
            version: 3,
            timestamp: Utc::now(),
            author_id: Uuid::new_v4(),
            author_name: "Bob".into(),
            change_type: ChangeType::Expanded,
            diff_summary: "Added 5 characters".into(),
        };
        let frame = Frame::Response {
            id: 1,
            result: Ok(Reply::History(vec![entry.clone()])),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            decoded,
            Frame::Response {
                id: 1,
                result: Ok(Reply::History(vec![entry]))
            }
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = Frame::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializationError(_)));
        assert!(matches!(
            StoreError::from(err),
            StoreError::DeserializationError(_)
        ));
    }

    #[test]
    fn test_request_doc_id_and_name() {
        let doc_id = Uuid::new_v4();
        let req = Request::RemovePresence {
            doc_id,
            user_id: Uuid::new_v4(),
        };
        assert_eq!(req.doc_id(), doc_id);
        assert_eq!(req.name(), "remove_presence");
    }
}
