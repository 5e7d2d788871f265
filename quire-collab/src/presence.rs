//! Presence: who else has this document open.
//!
//! Each session keeps one record in `documents/{doc_id}/collaborators/{user_id}`
//! while it has focus, refreshed by a heartbeat. Readers drop their own record
//! and any record whose `last_seen` is older than the staleness window, so a
//! crashed client disappears even if its record is never deleted.
//!
//! ## Architecture
//!
//! ```text
//!  LifecycleEvent::Focus ─┐            ┌─► upsert_presence (heartbeat)
//!  heartbeat tick ────────┼─► tracker ─┤
//!  set_cursor() ──────────┘   task     └─► remove_presence (blur)
//!                               ▲
//!  watch_presence() ────────────┘
//!        │
//!        ▼
//!  PresenceRoom::handle_event()  (self / stale filter)
//!        │
//!        ▼
//!  watch::Receiver<Vec<CollaboratorInfo>>
//! ```
//!
//! Presence is best effort. Publish failures are logged and never reach the
//! save path.
//!
//! Reference: Kleppmann, Chapter 8, Unreliable Clocks (leases and timeouts)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::error::SyncError;
use crate::lifecycle::{LifecycleEvent, recv_or_pending};
use crate::store::RemoteStore;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGB color for a collaborator's cursor and avatar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// A stable, vivid color derived from the user id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self { r, g, b }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection in character offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: u32,
    pub head: u32,
}

impl CursorPosition {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }
}

/// The local user as presented to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
}

impl UserIdentity {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
        }
    }

    pub fn color(&self) -> CursorColor {
        CursorColor::from_uuid(self.user_id)
    }
}

/// The `collaborators/{user_id}` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub last_seen: DateTime<Utc>,
}

/// A change to the collaborators collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    Upserted(PresenceRecord),
    Removed { user_id: Uuid },
}

impl PresenceEvent {
    pub fn user_id(&self) -> Uuid {
        match self {
            PresenceEvent::Upserted(record) => record.user_id,
            PresenceEvent::Removed { user_id } => *user_id,
        }
    }
}

/// One entry of the collaborator list exposed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorInfo {
    pub user_id: Uuid,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub last_seen: DateTime<Utc>,
}

impl From<&PresenceRecord> for CollaboratorInfo {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id,
            name: record.name.clone(),
            color: record.color.clone(),
            cursor: record.cursor,
            last_seen: record.last_seen,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room: remote records, filtered
// ───────────────────────────────────────────────────────────────────

/// Remote presence records for one document, as seen by the local user.
///
/// Pure state: callers pass `now` so staleness is testable.
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, PresenceRecord>,
    stale_after: chrono::Duration,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid, stale_after: Duration) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Replace all peers with a fresh listing.
    pub fn seed(&mut self, records: Vec<PresenceRecord>) {
        self.peers = records
            .into_iter()
            .filter(|r| r.user_id != self.local_user_id)
            .map(|r| (r.user_id, r))
            .collect();
    }

    /// Apply one change. Returns `true` if the peer set changed.
    pub fn handle_event(&mut self, event: &PresenceEvent) -> bool {
        if event.user_id() == self.local_user_id {
            return false;
        }
        match event {
            PresenceEvent::Upserted(record) => {
                self.peers.insert(record.user_id, record.clone()).as_ref() != Some(record)
            }
            PresenceEvent::Removed { user_id } => self.peers.remove(user_id).is_some(),
        }
    }

    pub fn is_stale(&self, record: &PresenceRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_seen) > self.stale_after
    }

    /// Live collaborators, sorted by name then id.
    pub fn collaborators(&self, now: DateTime<Utc>) -> Vec<CollaboratorInfo> {
        let mut list: Vec<CollaboratorInfo> = self
            .peers
            .values()
            .filter(|r| !self.is_stale(r, now))
            .map(CollaboratorInfo::from)
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        list
    }

    /// Forget records past the staleness window. Returns their user ids.
    pub fn cleanup_stale(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .peers
            .values()
            .filter(|r| self.is_stale(r, now))
            .map(|r| r.user_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker task
// ───────────────────────────────────────────────────────────────────

enum PresenceCommand {
    SetCursor(Option<CursorPosition>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background presence task of one session.
pub struct PresenceTracker {
    commands: mpsc::UnboundedSender<PresenceCommand>,
    collaborators: watch::Receiver<Vec<CollaboratorInfo>>,
    task: Option<JoinHandle<()>>,
}

struct TrackerTask {
    doc_id: Uuid,
    identity: UserIdentity,
    color: String,
    store: Arc<dyn RemoteStore>,
    room: PresenceRoom,
    focused: bool,
    cursor: Option<CursorPosition>,
    collaborators: watch::Sender<Vec<CollaboratorInfo>>,
}

impl PresenceTracker {
    /// Subscribe, seed the collaborator list, and start heartbeating.
    pub async fn spawn(
        doc_id: Uuid,
        identity: UserIdentity,
        store: Arc<dyn RemoteStore>,
        config: PresenceConfig,
        lifecycle: broadcast::Receiver<LifecycleEvent>,
    ) -> Result<Self, SyncError> {
        // Watch before listing so nothing falls between the two
        let events = store.watch_presence(doc_id).await?;
        let mut room = PresenceRoom::new(identity.user_id, config.stale_after);
        room.seed(store.list_presence(doc_id).await?);

        let (collab_tx, collab_rx) = watch::channel(room.collaborators(Utc::now()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = TrackerTask {
            doc_id,
            color: identity.color().to_hex(),
            identity,
            store,
            room,
            focused: config.start_focused,
            cursor: None,
            collaborators: collab_tx,
        };
        let handle = tokio::spawn(task.run(config, events, lifecycle, cmd_rx));

        Ok(Self {
            commands: cmd_tx,
            collaborators: collab_rx,
            task: Some(handle),
        })
    }

    /// Live collaborator list (excluding the local user).
    pub fn collaborators(&self) -> watch::Receiver<Vec<CollaboratorInfo>> {
        self.collaborators.clone()
    }

    /// Update the local cursor; republished immediately while focused.
    pub fn set_cursor(&self, cursor: Option<CursorPosition>) {
        let _ = self.commands.send(PresenceCommand::SetCursor(cursor));
    }

    /// Remove the local record and stop the task.
    pub async fn shutdown(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PresenceCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl TrackerTask {
    async fn run(
        mut self,
        config: PresenceConfig,
        events: broadcast::Receiver<PresenceEvent>,
        lifecycle: broadcast::Receiver<LifecycleEvent>,
        mut commands: mpsc::UnboundedReceiver<PresenceCommand>,
    ) {
        let mut events = Some(events);
        let mut lifecycle = Some(lifecycle);

        let now = Instant::now();
        let mut heartbeat = interval_at(now + config.heartbeat_interval, config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(now + config.sweep_interval, config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.focused {
            self.publish(true).await;
        }

        loop {
            tokio::select! {
                _ = heartbeat.tick(), if self.focused => {
                    self.publish(true).await;
                }

                _ = sweep.tick() => {
                    let gone = self.room.cleanup_stale(Utc::now());
                    if !gone.is_empty() {
                        log::debug!("Presence on {}: {} stale collaborator(s) dropped", self.doc_id, gone.len());
                    }
                    self.refresh();
                }

                result = recv_or_pending(&mut events) => match result {
                    Ok(event) => {
                        if self.room.handle_event(&event) {
                            self.refresh();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Presence on {} lagged {n} event(s), re-listing", self.doc_id);
                        match self.store.list_presence(self.doc_id).await {
                            Ok(records) => {
                                self.room.seed(records);
                                self.refresh();
                            }
                            Err(e) => log::warn!("Presence re-list failed: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::debug!("Presence subscription on {} closed", self.doc_id);
                        events = None;
                    }
                },

                result = recv_or_pending(&mut lifecycle) => match result {
                    Ok(LifecycleEvent::Focus) => {
                        self.focused = true;
                        heartbeat.reset();
                        self.publish(true).await;
                    }
                    Ok(LifecycleEvent::Blur) => {
                        self.focused = false;
                        self.publish(false).await;
                    }
                    Ok(LifecycleEvent::Unload) => {
                        self.focused = false;
                        self.store.send_cleanup_beacon(self.doc_id, self.identity.user_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => lifecycle = None,
                },

                command = commands.recv() => match command {
                    Some(PresenceCommand::SetCursor(cursor)) => {
                        self.cursor = cursor;
                        if self.focused {
                            self.publish(true).await;
                        }
                    }
                    Some(PresenceCommand::Shutdown(done)) => {
                        if self.focused {
                            self.publish(false).await;
                        }
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
            }
        }

        log::debug!("Presence tracker for {} stopped", self.doc_id);
    }

    /// Upsert (`active`) or delete the local record. Failures are logged only.
    async fn publish(&self, active: bool) {
        let result = if active {
            let record = PresenceRecord {
                user_id: self.identity.user_id,
                name: self.identity.name.clone(),
                color: self.color.clone(),
                cursor: self.cursor,
                last_seen: Utc::now(),
            };
            self.store.upsert_presence(self.doc_id, record).await
        } else {
            self.store
                .remove_presence(self.doc_id, self.identity.user_id)
                .await
        };

        if let Err(e) = result {
            log::warn!("{}", SyncError::PresencePublishFailed(e.to_string()));
        }
    }

    fn refresh(&self) {
        let next = self.room.collaborators(Utc::now());
        self.collaborators.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: Uuid, name: &str, last_seen: DateTime<Utc>) -> PresenceRecord {
        PresenceRecord {
            user_id,
            name: name.to_string(),
            color: CursorColor::from_uuid(user_id).to_hex(),
            cursor: None,
            last_seen,
        }
    }

    // ── Colors ───────────────────────────────────────────────────

    #[test]
    fn test_color_stable_per_user() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        assert_eq!(
            CursorColor::from_uuid(id).to_hex(),
            CursorColor::from_uuid(id).to_hex()
        );
    }

    #[test]
    fn test_color_hex_format() {
        let hex = CursorColor::from_uuid(Uuid::new_v4()).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
        assert!(hex[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_pure_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5);
        assert!(g.abs() < 1e-5);
        assert!(b.abs() < 1e-5);
    }

    #[test]
    fn test_hsl_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.4), (0.4, 0.4, 0.4));
    }

    // ── Room ─────────────────────────────────────────────────────

    #[test]
    fn test_room_ignores_self() {
        let me = Uuid::new_v4();
        let mut room = PresenceRoom::new(me, Duration::from_secs(30));
        let now = Utc::now();

        assert!(!room.handle_event(&PresenceEvent::Upserted(record(me, "Me", now))));
        room.seed(vec![record(me, "Me", now)]);
        assert_eq!(room.peer_count(), 0);
        assert!(room.collaborators(now).is_empty());
    }

    #[test]
    fn test_room_upsert_and_remove() {
        let mut room = PresenceRoom::new(Uuid::new_v4(), Duration::from_secs(30));
        let bob = Uuid::new_v4();
        let now = Utc::now();

        assert!(room.handle_event(&PresenceEvent::Upserted(record(bob, "Bob", now))));
        // Identical upsert is not a change
        assert!(!room.handle_event(&PresenceEvent::Upserted(record(bob, "Bob", now))));
        assert_eq!(room.collaborators(now).len(), 1);

        assert!(room.handle_event(&PresenceEvent::Removed { user_id: bob }));
        assert!(!room.handle_event(&PresenceEvent::Removed { user_id: bob }));
        assert!(room.collaborators(now).is_empty());
    }

    #[test]
    fn test_room_filters_stale_records() {
        let mut room = PresenceRoom::new(Uuid::new_v4(), Duration::from_secs(30));
        let now = Utc::now();
        let fresh = Uuid::new_v4();
        let old = Uuid::new_v4();

        room.seed(vec![
            record(fresh, "Fresh", now - chrono::Duration::seconds(5)),
            record(old, "Old", now - chrono::Duration::seconds(31)),
        ]);

        let list = room.collaborators(now);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].user_id, fresh);

        assert_eq!(room.cleanup_stale(now), vec![old]);
        assert_eq!(room.peer_count(), 1);
    }

    #[test]
    fn test_room_becomes_stale_over_time() {
        let mut room = PresenceRoom::new(Uuid::new_v4(), Duration::from_secs(30));
        let seen = Utc::now();
        room.handle_event(&PresenceEvent::Upserted(record(Uuid::new_v4(), "Ann", seen)));

        assert_eq!(room.collaborators(seen + chrono::Duration::seconds(30)).len(), 1);
        assert!(room.collaborators(seen + chrono::Duration::seconds(31)).is_empty());
    }

    #[test]
    fn test_room_sorted_by_name() {
        let mut room = PresenceRoom::new(Uuid::new_v4(), Duration::from_secs(30));
        let now = Utc::now();
        for name in ["Carol", "Alice", "Bob"] {
            room.handle_event(&PresenceEvent::Upserted(record(Uuid::new_v4(), name, now)));
        }
        let names: Vec<String> = room.collaborators(now).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn test_cursor_caret() {
        let c = CursorPosition::caret(4);
        assert_eq!(c.anchor, c.head);
    }
}
