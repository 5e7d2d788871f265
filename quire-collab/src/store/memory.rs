//! In-process [`RemoteStore`].
//!
//! Shared by every session in the same process (clone the handle), so two
//! `DocumentSession`s over one `MemoryStore` behave like two browser tabs
//! over one backend. Fault switches let tests simulate outages and revoked
//! write access without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use super::{
    CreateOutcome, RemoteStore, RoomManager, ServerClock, SnapshotRecord, StoreError,
};
use crate::history::HistoryEntry;
use crate::presence::{PresenceEvent, PresenceRecord};

/// Notifications buffered per watcher.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Write counters, for asserting how many pushes actually happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub snapshot_writes: u64,
    pub presence_writes: u64,
    pub presence_removals: u64,
    pub history_writes: u64,
}

#[derive(Default)]
struct AtomicStoreStats {
    snapshot_writes: AtomicU64,
    presence_writes: AtomicU64,
    presence_removals: AtomicU64,
    history_writes: AtomicU64,
}

#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    deny_writes: AtomicBool,
    fail_snapshot_writes: AtomicU32,
    fail_history: AtomicBool,
    fail_presence: AtomicBool,
}

struct Inner {
    snapshots: Mutex<HashMap<Uuid, SnapshotRecord>>,
    presence: Mutex<HashMap<Uuid, HashMap<Uuid, PresenceRecord>>>,
    history: Mutex<HashMap<Uuid, BTreeMap<u64, HistoryEntry>>>,
    counters: Mutex<HashMap<Uuid, u64>>,
    rooms: RoomManager,
    clock: ServerClock,
    faults: Faults,
    stats: AtomicStoreStats,
}

/// Cloneable handle to a shared in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// `capacity` bounds how far a watcher may fall behind before lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshots: Mutex::new(HashMap::new()),
                presence: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                counters: Mutex::new(HashMap::new()),
                rooms: RoomManager::new(capacity),
                clock: ServerClock::default(),
                faults: Faults::default(),
                stats: AtomicStoreStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let s = &self.inner.stats;
        StoreStats {
            snapshot_writes: s.snapshot_writes.load(Ordering::Relaxed),
            presence_writes: s.presence_writes.load(Ordering::Relaxed),
            presence_removals: s.presence_removals.load(Ordering::Relaxed),
            history_writes: s.history_writes.load(Ordering::Relaxed),
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    // ─── Fault switches ───────────────────────────────────────────────

    /// Every operation fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot writes fail with `PermissionDenied` while set.
    pub fn set_deny_writes(&self, deny: bool) {
        self.inner.faults.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// The next `count` snapshot writes fail with `Unavailable`.
    pub fn fail_next_snapshot_writes(&self, count: u32) {
        self.inner
            .faults
            .fail_snapshot_writes
            .store(count, Ordering::SeqCst);
    }

    /// History appends fail with `Unavailable` while set.
    pub fn set_fail_history(&self, fail: bool) {
        self.inner.faults.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Presence writes fail with `Unavailable` while set.
    pub fn set_fail_presence(&self, fail: bool) {
        self.inner.faults.fail_presence.store(fail, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.inner.faults.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        Ok(())
    }

    fn check_snapshot_write(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.check_online()?;
        let faults = &self.inner.faults;
        if faults.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(format!(
                "write to documents/{doc_id} not allowed"
            )));
        }
        let pending = faults.fail_snapshot_writes.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if pending.is_ok() {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn check_presence_write(&self) -> Result<(), StoreError> {
        self.check_online()?;
        if self.inner.faults.fail_presence.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("presence collection unreachable".into()));
        }
        Ok(())
    }

    async fn publish_snapshot(&self, doc_id: Uuid, record: SnapshotRecord) {
        let reached = self.inner.rooms.publish_snapshot(doc_id, record).await;
        log::trace!("documents/{doc_id} notified {reached} watcher(s)");
    }

    async fn publish_presence(&self, doc_id: Uuid, event: PresenceEvent) {
        self.inner.rooms.publish_presence(doc_id, event).await;
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        self.check_online()?;
        Ok(self.inner.snapshots.lock().await.get(&doc_id).cloned())
    }

    async fn create_snapshot_if_absent(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<CreateOutcome, StoreError> {
        self.check_snapshot_write(doc_id)?;
        let mut snapshots = self.inner.snapshots.lock().await;
        if let Some(existing) = snapshots.get(&doc_id) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        let record = SnapshotRecord {
            content,
            updated_at: self.inner.clock.now(),
        };
        snapshots.insert(doc_id, record.clone());
        self.inner.stats.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        // Publish under the map lock so watchers see writes in order
        self.publish_snapshot(doc_id, record.clone()).await;
        Ok(CreateOutcome::Created(record))
    }

    async fn put_snapshot(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<SnapshotRecord, StoreError> {
        self.check_snapshot_write(doc_id)?;
        let mut snapshots = self.inner.snapshots.lock().await;
        let record = SnapshotRecord {
            content,
            updated_at: self.inner.clock.now(),
        };
        snapshots.insert(doc_id, record.clone());
        self.inner.stats.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        self.publish_snapshot(doc_id, record.clone()).await;
        Ok(record)
    }

    async fn watch_snapshot(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<SnapshotRecord>, StoreError> {
        self.check_online()?;
        Ok(self.inner.rooms.get_or_create(doc_id).await.watch_snapshots())
    }

    async fn upsert_presence(
        &self,
        doc_id: Uuid,
        record: PresenceRecord,
    ) -> Result<(), StoreError> {
        self.check_presence_write()?;
        let mut presence = self.inner.presence.lock().await;
        presence
            .entry(doc_id)
            .or_default()
            .insert(record.user_id, record.clone());
        self.inner.stats.presence_writes.fetch_add(1, Ordering::Relaxed);
        self.publish_presence(doc_id, PresenceEvent::Upserted(record)).await;
        Ok(())
    }

    async fn remove_presence(&self, doc_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        self.check_presence_write()?;
        let mut presence = self.inner.presence.lock().await;
        let removed = presence
            .get_mut(&doc_id)
            .and_then(|peers| peers.remove(&user_id))
            .is_some();
        if removed {
            self.inner.stats.presence_removals.fetch_add(1, Ordering::Relaxed);
            self.publish_presence(doc_id, PresenceEvent::Removed { user_id }).await;
        }
        Ok(())
    }

    async fn list_presence(&self, doc_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError> {
        self.check_online()?;
        let presence = self.inner.presence.lock().await;
        Ok(presence
            .get(&doc_id)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch_presence(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<PresenceEvent>, StoreError> {
        self.check_online()?;
        Ok(self.inner.rooms.get_or_create(doc_id).await.watch_presence())
    }

    async fn next_version(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        self.check_online()?;
        if self.inner.faults.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("history counter unreachable".into()));
        }
        let mut counters = self.inner.counters.lock().await;
        let counter = counters.entry(doc_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn append_history(&self, doc_id: Uuid, entry: HistoryEntry) -> Result<(), StoreError> {
        self.check_online()?;
        if self.inner.faults.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("history collection unreachable".into()));
        }
        let mut history = self.inner.history.lock().await;
        let entries = history.entry(doc_id).or_default();
        if entries.contains_key(&entry.version) {
            return Err(StoreError::AlreadyExists(format!(
                "documents/{doc_id}/history/{}",
                entry.version
            )));
        }
        entries.insert(entry.version, entry);
        self.inner.stats.history_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list_history(&self, doc_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        self.check_online()?;
        let history = self.inner.history.lock().await;
        Ok(history
            .get(&doc_id)
            .map(|entries| entries.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn send_cleanup_beacon(&self, doc_id: Uuid, user_id: Uuid) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime for cleanup beacon ({user_id} on {doc_id})");
            return;
        };
        let store = self.clone();
        handle.spawn(async move {
            if let Err(e) = store.remove_presence(doc_id, user_id).await {
                log::debug!("Cleanup beacon for {user_id} dropped: {e}");
            }
        });
    }
}
