//! Snapshot-based sync transport.
//!
//! The remote store only offers "the whole document changed" notifications,
//! not an operation log. Every record is a complete encoded state, so the
//! transport merges each one into the replica and lets the CRDT discard what
//! it already has.
//!
//! ```text
//!   start()
//!     │ watch_snapshot (subscribe first)
//!     │ get_snapshot
//!     ├── None ──► Bootstrapping ──► create_snapshot_if_absent
//!     │                                 ├── Created ──────────────► Synced
//!     │                                 └── AlreadyExists(winner) ─► merge ─► Synced
//!     └── Some(record) ──► merge (origin Remote) ───────────────────────────► Synced
//!
//!   watcher task:  record ──► merge (origin Remote)     never pushes
//!                  lagged ──► get_snapshot ──► merge
//!
//!   push():  encode_full_state ──► base64 ──► put_snapshot
//! ```
//!
//! The transport also remembers the text of the newest record it has merged
//! or written, so a push can report what the store held before it. Records
//! older than the remembered one never replace it.
//!
//! Echoes of our own pushes come back as notifications and merge as
//! `Unchanged`, so they produce no change event and no follow-up push.
//!
//! Reference: Kleppmann, Chapter 5, Multi-Leader Replication

use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SyncError;
use crate::replica::{ApplyOutcome, Origin, Replica, SharedReplica};
use crate::store::{CreateOutcome, RemoteStore, SnapshotRecord, StoreError};

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    /// Writing the first record of a document that did not exist yet.
    Bootstrapping,
    Synced,
    /// The last read or write failed, or the only known record is corrupt.
    Error,
}

/// What a successful push wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub record: SnapshotRecord,
    /// Rendered text at the moment the state was encoded.
    pub content: String,
    /// Text of the newest record known before this write, empty if none.
    pub previous_content: String,
}

/// Text of the newest record this transport has seen.
#[derive(Debug, Clone)]
struct StoredText {
    updated_at: DateTime<Utc>,
    text: String,
}

/// Base64 of an encoded CRDT state, as stored in `SnapshotRecord::content`.
pub fn encode_content(state: &[u8]) -> String {
    STANDARD.encode(state)
}

pub fn decode_content(content: &str) -> Result<Vec<u8>, SyncError> {
    STANDARD
        .decode(content)
        .map_err(|e| SyncError::MalformedRemoteState(format!("invalid base64: {e}")))
}

/// Bridges one [`Replica`](crate::replica::Replica) and one document in a
/// [`RemoteStore`].
pub struct SyncTransport {
    doc_id: Uuid,
    replica: SharedReplica,
    store: Arc<dyn RemoteStore>,
    state: watch::Sender<TransportState>,
    synced: watch::Sender<bool>,
    last_stored: Mutex<Option<StoredText>>,
}

impl SyncTransport {
    pub fn new(doc_id: Uuid, replica: SharedReplica, store: Arc<dyn RemoteStore>) -> Arc<Self> {
        let (state, _) = watch::channel(TransportState::Disconnected);
        let (synced, _) = watch::channel(false);
        Arc::new(Self {
            doc_id,
            replica,
            store,
            state,
            synced,
            last_stored: Mutex::new(None),
        })
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Whether a remote state has been merged (or written) at least once.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first successful merge or bootstrap completes.
    pub async fn wait_synced(&self) -> Result<(), SyncError> {
        let mut rx = self.synced.subscribe();
        rx.wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Subscribe, load or bootstrap the remote record, and start applying
    /// notifications. Transient and permission failures are returned.
    pub async fn start(self: &Arc<Self>) -> Result<SyncSubscription, SyncError> {
        log::debug!("Starting sync for document {}", self.doc_id);

        // Subscribe before reading so no write can fall between the two
        let updates = self
            .store
            .watch_snapshot(self.doc_id)
            .await
            .map_err(|e| self.fail(e))?;

        match self.store.get_snapshot(self.doc_id).await {
            Ok(Some(record)) => {
                if !self.apply_record(&record).await {
                    self.set_state(TransportState::Error);
                }
            }
            Ok(None) => self.bootstrap().await?,
            Err(e) => return Err(self.fail(e)),
        }

        let task = tokio::spawn(Arc::clone(self).watch_loop(updates));
        Ok(SyncSubscription {
            transport: Arc::clone(self),
            task: Some(task),
        })
    }

    /// Write the complete local state. The store stamps the record.
    pub async fn push(&self) -> Result<PushReceipt, SyncError> {
        let (content, text) = {
            let replica = self.replica.lock().await;
            (encode_content(&replica.encode_full_state()), replica.content())
        };

        let before = self.lock_stored().clone();
        match self.store.put_snapshot(self.doc_id, content).await {
            Ok(record) => {
                log::trace!(
                    "Pushed {} ({} chars) at {}",
                    self.doc_id,
                    text.chars().count(),
                    record.updated_at
                );
                self.mark_synced();
                let previous_content = self.text_before(record.updated_at, before);
                self.remember(record.updated_at, || Some(text.clone()));
                Ok(PushReceipt {
                    record,
                    content: text,
                    previous_content,
                })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// First writer of a document. Losing the race is not an error: the
    /// winner's record is merged instead.
    async fn bootstrap(&self) -> Result<(), SyncError> {
        self.set_state(TransportState::Bootstrapping);
        let (content, text) = {
            let replica = self.replica.lock().await;
            (encode_content(&replica.encode_full_state()), replica.content())
        };

        match self.store.create_snapshot_if_absent(self.doc_id, content).await {
            Ok(CreateOutcome::Created(record)) => {
                log::info!("Bootstrapped document {}", self.doc_id);
                self.remember(record.updated_at, || Some(text));
                self.mark_synced();
                Ok(())
            }
            Ok(CreateOutcome::AlreadyExists(winner)) => {
                log::info!(
                    "Document {} was bootstrapped concurrently, merging existing record",
                    self.doc_id
                );
                if !self.apply_record(&winner).await {
                    self.set_state(TransportState::Error);
                }
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Merge one record. Returns `false` if it was malformed (already logged).
    async fn apply_record(&self, record: &SnapshotRecord) -> bool {
        let bytes = match decode_content(&record.content) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping record for {} from {}: {e}", self.doc_id, record.updated_at);
                return false;
            }
        };

        let outcome = {
            let mut replica = self.replica.lock().await;
            replica.apply_remote_update(&bytes, Origin::Remote)
        };

        match outcome {
            ApplyOutcome::Applied | ApplyOutcome::Unchanged => {
                log::trace!("Merged record for {} ({outcome:?})", self.doc_id);
                self.remember(record.updated_at, || render(&bytes));
                self.mark_synced();
                true
            }
            ApplyOutcome::Rejected => {
                log::warn!(
                    "{}",
                    SyncError::MalformedRemoteState(format!(
                        "record for {} from {} could not be merged",
                        self.doc_id, record.updated_at
                    ))
                );
                false
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, mut updates: broadcast::Receiver<SnapshotRecord>) {
        loop {
            match updates.recv().await {
                Ok(record) => {
                    self.apply_record(&record).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Records are full snapshots: the latest one covers the missed ones
                    log::debug!("Sync for {} lagged {missed} record(s), re-reading", self.doc_id);
                    match self.store.get_snapshot(self.doc_id).await {
                        Ok(Some(record)) => {
                            self.apply_record(&record).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("Re-read of {} failed: {e}", self.doc_id);
                            self.set_state(TransportState::Error);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    log::info!("Snapshot subscription for {} closed", self.doc_id);
                    self.set_state(TransportState::Disconnected);
                    break;
                }
            }
        }
    }

    /// Text of the newest record merged or written so far.
    pub fn stored_text(&self) -> Option<String> {
        self.lock_stored().as_ref().map(|stored| stored.text.clone())
    }

    /// Text of the newest known record older than `updated_at`. The watcher
    /// may already have merged our own echo or a later write, in which case
    /// the text remembered before the write is used.
    fn text_before(&self, updated_at: DateTime<Utc>, before: Option<StoredText>) -> String {
        let current = self.lock_stored().clone();
        current
            .filter(|stored| stored.updated_at < updated_at)
            .or(before)
            .map(|stored| stored.text)
            .unwrap_or_default()
    }

    /// Replace the remembered text if `updated_at` is newer. `text` is only
    /// evaluated when it is.
    fn remember(&self, updated_at: DateTime<Utc>, text: impl FnOnce() -> Option<String>) {
        let mut stored = self.lock_stored();
        if stored.as_ref().is_some_and(|s| s.updated_at >= updated_at) {
            return;
        }
        if let Some(text) = text() {
            *stored = Some(StoredText { updated_at, text });
        }
    }

    fn lock_stored(&self) -> std::sync::MutexGuard<'_, Option<StoredText>> {
        self.last_stored
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_synced(&self) {
        self.set_state(TransportState::Synced);
        let first = self.synced.send_if_modified(|synced| {
            let was = *synced;
            *synced = true;
            !was
        });
        if first {
            log::info!("Document {} synced", self.doc_id);
        }
    }

    fn set_state(&self, next: TransportState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            log::debug!("Transport {}: {:?} -> {next:?}", self.doc_id, state);
            *state = next;
            true
        });
    }

    fn fail(&self, e: StoreError) -> SyncError {
        self.set_state(TransportState::Error);
        SyncError::from(e)
    }
}

/// Text of an encoded state on its own, without the local replica's edits.
fn render(state: &[u8]) -> Option<String> {
    let mut scratch = Replica::new();
    match scratch.apply_remote_update(state, Origin::Remote) {
        ApplyOutcome::Rejected => None,
        ApplyOutcome::Applied | ApplyOutcome::Unchanged => Some(scratch.content()),
    }
}

/// The running notification watcher. Stops on [`stop`](Self::stop) or drop.
/// Stopping never flushes.
pub struct SyncSubscription {
    transport: Arc<SyncTransport>,
    task: Option<JoinHandle<()>>,
}

impl SyncSubscription {
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.transport.set_state(TransportState::Disconnected);
        }
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        self.abort();
    }
}
