//! Per-document change notification fan-out.
//!
//! Every store keeps one [`BroadcastGroup`] per document. A write is sent
//! once and fanned out to every watcher of that document; watchers that fall
//! more than `capacity` notifications behind see `RecvError::Lagged` and are
//! expected to re-read the record.
//!
//! ```text
//!   put_snapshot ──► BroadcastGroup(doc) ──┬──► watcher A
//!                                          ├──► watcher B
//!                                          └──► watcher C
//! ```
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use super::SnapshotRecord;
use crate::presence::PresenceEvent;

/// Notification counters for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub snapshots_sent: u64,
    pub presence_sent: u64,
    /// Sends that found no live receiver.
    pub undelivered: u64,
    pub snapshot_watchers: usize,
    pub presence_watchers: usize,
}

struct AtomicBroadcastStats {
    snapshots_sent: AtomicU64,
    presence_sent: AtomicU64,
    undelivered: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            snapshots_sent: AtomicU64::new(0),
            presence_sent: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }
}

/// Notification channels for a single document.
pub struct BroadcastGroup {
    snapshots: broadcast::Sender<SnapshotRecord>,
    presence: broadcast::Sender<PresenceEvent>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of notifications buffered per watcher
    /// before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (snapshots, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            snapshots,
            presence,
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn watch_snapshots(&self) -> broadcast::Receiver<SnapshotRecord> {
        self.snapshots.subscribe()
    }

    pub fn watch_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Fan a snapshot write out. Returns the number of watchers reached.
    pub fn publish_snapshot(&self, record: SnapshotRecord) -> usize {
        self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        match self.snapshots.send(record) {
            Ok(n) => n,
            Err(_) => {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Fan a presence change out. Returns the number of watchers reached.
    pub fn publish_presence(&self, event: PresenceEvent) -> usize {
        self.stats.presence_sent.fetch_add(1, Ordering::Relaxed);
        match self.presence.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.snapshots.receiver_count() + self.presence.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            snapshots_sent: self.stats.snapshots_sent.load(Ordering::Relaxed),
            presence_sent: self.stats.presence_sent.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
            snapshot_watchers: self.snapshots.receiver_count(),
            presence_watchers: self.presence.receiver_count(),
        }
    }
}

/// Maps document IDs to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `doc_id`.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }

        // Groups nobody watches or holds are swept whenever a new one is made
        rooms.retain(|_, room| !Self::is_idle(room));

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(doc_id, room.clone());
        room
    }

    /// The group for `doc_id` if one exists. Publishing to a document
    /// nobody watches never needs to allocate a group.
    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Drop the group once nobody is watching it.
    pub async fn remove_if_idle(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.get(doc_id).is_some_and(Self::is_idle) {
            rooms.remove(doc_id);
            return true;
        }
        false
    }

    /// Fan a snapshot out to `doc_id`'s watchers, if it has any. A group
    /// whose watchers have all gone is dropped.
    pub async fn publish_snapshot(&self, doc_id: Uuid, record: SnapshotRecord) -> usize {
        let Some(room) = self.get(&doc_id).await else {
            return 0;
        };
        let reached = room.publish_snapshot(record);
        drop(room);
        if reached == 0 {
            self.remove_if_idle(&doc_id).await;
        }
        reached
    }

    /// Fan a presence change out. Same clean-up rule as
    /// [`publish_snapshot`](Self::publish_snapshot).
    pub async fn publish_presence(&self, doc_id: Uuid, event: PresenceEvent) -> usize {
        let Some(room) = self.get(&doc_id).await else {
            return 0;
        };
        let reached = room.publish_presence(event);
        drop(room);
        if reached == 0 {
            self.remove_if_idle(&doc_id).await;
        }
        reached
    }

    /// No receivers, and no handle outside the map that could still
    /// subscribe one.
    fn is_idle(room: &Arc<BroadcastGroup>) -> bool {
        room.watcher_count() == 0 && Arc::strong_count(room) == 1
    }

    /// Drop every group. Watchers see `RecvError::Closed` once they have
    /// drained what was already sent.
    pub async fn clear(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let n = rooms.len();
        rooms.clear();
        n
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(content: &str) -> SnapshotRecord {
        SnapshotRecord {
            content: content.to_string(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.watch_snapshots();
        let mut rx2 = group.watch_snapshots();
        let mut rx3 = group.watch_snapshots();

        assert_eq!(group.publish_snapshot(record("AAA=")), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(rx.recv().await.unwrap().content, "AAA=");
        }
        assert_eq!(group.stats().snapshots_sent, 1);
        assert_eq!(group.stats().snapshot_watchers, 3);
    }

    #[tokio::test]
    async fn test_publish_without_watchers_counts_undelivered() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.publish_snapshot(record("x")), 0);
        assert_eq!(
            group.publish_presence(PresenceEvent::Removed {
                user_id: Uuid::new_v4()
            }),
            0
        );
        let stats = group.stats();
        assert_eq!(stats.undelivered, 2);
        assert_eq!(stats.presence_sent, 1);
    }

    #[tokio::test]
    async fn test_slow_watcher_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.watch_snapshots();
        for i in 0..5 {
            group.publish_snapshot(record(&i.to_string()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // The newest records are still there after the lag notice
        assert_eq!(rx.recv().await.unwrap().content, "3");
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let a = manager.get_or_create(doc_id).await;
        let b = manager.get_or_create(doc_id).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_remove_if_idle() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let room = manager.get_or_create(doc_id).await;
        let rx = room.watch_presence();
        assert!(!manager.remove_if_idle(&doc_id).await);

        drop(rx);
        // Still held, so a watcher could yet subscribe
        assert!(!manager.remove_if_idle(&doc_id).await);

        drop(room);
        assert!(manager.remove_if_idle(&doc_id).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.active_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_drops_abandoned_room() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let rx = manager.get_or_create(doc_id).await.watch_snapshots();
        assert_eq!(manager.publish_snapshot(doc_id, record("a")).await, 1);
        assert_eq!(manager.room_count().await, 1);

        drop(rx);
        assert_eq!(manager.publish_snapshot(doc_id, record("b")).await, 0);
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(manager.publish_snapshot(doc_id, record("c")).await, 0);
    }

    #[tokio::test]
    async fn test_publish_keeps_room_with_presence_watcher() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();
        let mut rx = manager.get_or_create(doc_id).await.watch_presence();

        assert_eq!(manager.publish_snapshot(doc_id, record("a")).await, 0);
        assert_eq!(manager.room_count().await, 1);

        let user_id = Uuid::new_v4();
        assert_eq!(
            manager.publish_presence(doc_id, PresenceEvent::Removed { user_id }).await,
            1
        );
        assert_eq!(rx.recv().await.unwrap(), PresenceEvent::Removed { user_id });
    }

    #[tokio::test]
    async fn test_new_room_sweeps_idle_rooms() {
        let manager = RoomManager::new(16);
        let watched = Uuid::new_v4();
        let _rx = manager.get_or_create(watched).await.watch_snapshots();
        for _ in 0..10 {
            // Watched once, then abandoned
            drop(manager.get_or_create(Uuid::new_v4()).await.watch_snapshots());
        }

        manager.get_or_create(Uuid::new_v4()).await;
        let docs = manager.active_documents().await;
        assert_eq!(docs.len(), 2);
        assert!(docs.contains(&watched));
    }

    #[tokio::test]
    async fn test_room_manager_clear_closes_watchers() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create(Uuid::new_v4()).await;
        let mut rx = room.watch_snapshots();
        room.publish_snapshot(record("last"));
        drop(room);

        assert_eq!(manager.clear().await, 1);
        assert_eq!(rx.recv().await.unwrap().content, "last");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
