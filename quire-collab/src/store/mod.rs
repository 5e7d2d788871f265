//! Remote store abstraction and implementations.
//!
//! The replication core only ever talks to a [`RemoteStore`]: a per-document
//! snapshot record with change notifications, an ephemeral presence
//! collection, and an append-only history collection.
//!
//! ```text
//! documents/{doc_id}                         ← SnapshotRecord
//! documents/{doc_id}/collaborators/{user_id} ← PresenceRecord
//! documents/{doc_id}/history/{version}       ← HistoryEntry
//! ```
//!
//! Implementations:
//!
//! | Store | Backing | Notifications |
//! |-------|---------|---------------|
//! | [`MemoryStore`] | in-process maps | tokio broadcast |
//! | [`RocksStore`]  | RocksDB (LZ4 snapshots) | tokio broadcast |
//! | [`RelayStore`](crate::relay::RelayStore) | WebSocket relay | `Notify` frames |

pub mod broadcast;
pub mod memory;
pub mod rocks;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast as tokio_broadcast;
use uuid::Uuid;

use crate::history::HistoryEntry;
use crate::presence::{PresenceEvent, PresenceRecord};

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// The `documents/{doc_id}` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Base64 of the encoded full CRDT state.
    pub content: String,
    /// Store-assigned write time.
    pub updated_at: DateTime<Utc>,
}

/// Result of a create-if-absent write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateOutcome {
    /// Our record was written.
    Created(SnapshotRecord),
    /// Another writer got there first; this is their record.
    AlreadyExists(SnapshotRecord),
}

/// Storage errors. Serializable so the relay can carry them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StoreError {
    /// Connectivity failure; the operation may succeed later.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The caller lacks the capability for this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// An immutable record with this key already exists.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// A remote snapshot store as seen by one client process.
///
/// All methods take `&self`; implementations handle their own locking.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    // ─── Snapshots ────────────────────────────────────────────────────

    /// Read the current snapshot record, if any.
    async fn get_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Write the initial record unless one already exists.
    async fn create_snapshot_if_absent(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<CreateOutcome, StoreError>;

    /// Replace the record, stamping it with the store's clock.
    async fn put_snapshot(&self, doc_id: Uuid, content: String)
        -> Result<SnapshotRecord, StoreError>;

    /// Subscribe to every subsequent write of the record.
    async fn watch_snapshot(
        &self,
        doc_id: Uuid,
    ) -> Result<tokio_broadcast::Receiver<SnapshotRecord>, StoreError>;

    // ─── Presence ─────────────────────────────────────────────────────

    async fn upsert_presence(&self, doc_id: Uuid, record: PresenceRecord)
        -> Result<(), StoreError>;

    async fn remove_presence(&self, doc_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;

    async fn list_presence(&self, doc_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError>;

    async fn watch_presence(
        &self,
        doc_id: Uuid,
    ) -> Result<tokio_broadcast::Receiver<PresenceEvent>, StoreError>;

    // ─── History ──────────────────────────────────────────────────────

    /// Atomically allocate the next version number (1, 2, 3, …).
    async fn next_version(&self, doc_id: Uuid) -> Result<u64, StoreError>;

    /// Append an immutable entry. Fails with `AlreadyExists` on reuse.
    async fn append_history(&self, doc_id: Uuid, entry: HistoryEntry) -> Result<(), StoreError>;

    /// All entries, newest first.
    async fn list_history(&self, doc_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError>;

    // ─── Out-of-band ──────────────────────────────────────────────────

    /// Fire-and-forget presence cleanup for process teardown. Must not block.
    fn send_cleanup_beacon(&self, doc_id: Uuid, user_id: Uuid);
}

/// Store-side timestamp source. Strictly increasing, so two writes never
/// share an `updated_at`.
#[derive(Debug, Default)]
pub(crate) struct ServerClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ServerClock {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + ChronoDuration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_clock_strictly_increasing() {
        let clock = ServerClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_store_error_display() {
        let e = StoreError::Unavailable("timeout".into());
        assert_eq!(e.to_string(), "Store unavailable: timeout");
        let e = StoreError::AlreadyExists("history/v3".into());
        assert!(e.to_string().contains("history/v3"));
    }
}
