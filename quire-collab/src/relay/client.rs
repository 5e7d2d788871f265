//! [`RemoteStore`] over a WebSocket connection to a relay.
//!
//! ```text
//!  store call ──► pending[id] ──► out channel ──► writer task ──► WebSocket
//!                     ▲                                              │
//!                     └──── Response { id } ◄─── reader task ◄───────┘
//!                                                    │
//!                        RoomManager (local fan-out) ◄── Notify(..)
//! ```
//!
//! Every network failure surfaces as `StoreError::Unavailable`. When the
//! connection drops, in-flight calls fail, local watchers see their channel
//! close, and every later call fails fast.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::protocol::{Frame, Notification, ProtocolError, Reply, Request};
use crate::history::HistoryEntry;
use crate::presence::{PresenceEvent, PresenceRecord};
use crate::store::{CreateOutcome, RemoteStore, RoomManager, SnapshotRecord, StoreError};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Client-side relay settings.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// A call with no response after this long fails as `Unavailable`.
    pub request_timeout: Duration,
    /// Outgoing frames buffered before callers wait.
    pub channel_capacity: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Snapshot,
    Presence,
}

type PendingReply = oneshot::Sender<Result<Reply, StoreError>>;

/// State shared with the reader task.
struct Shared {
    pending: Mutex<HashMap<u64, PendingReply>>,
    rooms: RoomManager,
    subscriptions: tokio::sync::Mutex<HashSet<(Uuid, Channel)>>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingReply>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    async fn deliver(&self, notification: Notification) {
        let doc_id = notification.doc_id();
        let reached = match notification {
            Notification::Snapshot { record, .. } => {
                self.rooms.publish_snapshot(doc_id, record).await
            }
            Notification::Presence { event, .. } => {
                self.rooms.publish_presence(doc_id, event).await
            }
        };
        if reached == 0 {
            log::trace!("Dropped notification for unwatched {doc_id}");
        }
    }

    async fn disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        let pending: Vec<PendingReply> = self.pending().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(StoreError::Unavailable("relay connection closed".into())));
        }
        self.subscriptions.lock().await.clear();
        self.rooms.clear().await;
    }
}

/// A [`RemoteStore`] backed by a relay connection. Cheap to clone; clones
/// share the connection.
#[derive(Clone)]
pub struct RelayStore {
    url: String,
    config: RelayClientConfig,
    outgoing: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl RelayStore {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, RelayClientConfig::default()).await
    }

    pub async fn connect_with(url: &str, config: RelayClientConfig) -> Result<Self, StoreError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect to {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.channel_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            rooms: RoomManager::new(config.channel_capacity.max(1)),
            subscriptions: tokio::sync::Mutex::new(HashSet::new()),
            state,
        });

        // Writer task: runs until every RelayStore clone is gone
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task
        let reader = shared.clone();
        let peer = url.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Response { id, result }) => {
                            let waiter = reader.pending().remove(&id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => log::debug!("Late response {id} from {peer}"),
                            }
                        }
                        Ok(Frame::Notify(notification)) => reader.deliver(notification).await,
                        Ok(other) => log::warn!("Unexpected frame from {peer}: {other:?}"),
                        Err(e) => log::warn!("Undecodable frame from {peer}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket error from {peer}: {e}");
                        break;
                    }
                }
            }
            reader.disconnect().await;
            log::info!("Disconnected from relay {peer}");
        });

        log::info!("Connected to relay {url}");

        Ok(Self {
            url: url.to_string(),
            config,
            outgoing: out_tx,
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn closed(&self) -> StoreError {
        StoreError::Unavailable(format!("relay {} connection closed", self.url))
    }

    /// Send one request and wait for its response.
    async fn request(&self, body: Request) -> Result<Reply, StoreError> {
        if !self.shared.is_connected() {
            return Err(self.closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = body.name();
        let encoded = Frame::Request { id, body }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        // The reader may have failed the pending map between the check above
        // and the insert
        if !self.shared.is_connected() {
            self.shared.pending().remove(&id);
            return Err(self.closed());
        }

        if self.outgoing.send(encoded).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(self.closed());
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(StoreError::Unavailable(format!(
                    "{name} timed out after {:?}",
                    self.config.request_timeout
                )))
            }
        }
    }

    /// Open the relay-side watch for `doc_id` once per connection.
    async fn ensure_subscribed(&self, doc_id: Uuid, channel: Channel) -> Result<(), StoreError> {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if subscriptions.contains(&(doc_id, channel)) {
            return Ok(());
        }
        let body = match channel {
            Channel::Snapshot => Request::SubscribeSnapshot { doc_id },
            Channel::Presence => Request::SubscribePresence { doc_id },
        };
        match self.request(body).await? {
            Reply::Done => {
                subscriptions.insert((doc_id, channel));
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedReply("subscribe").into()),
        }
    }
}

#[async_trait]
impl RemoteStore for RelayStore {
    async fn get_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, StoreError> {
        match self.request(Request::GetSnapshot { doc_id }).await? {
            Reply::Snapshot(record) => Ok(record),
            _ => Err(ProtocolError::UnexpectedReply("get_snapshot").into()),
        }
    }

    async fn create_snapshot_if_absent(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<CreateOutcome, StoreError> {
        match self.request(Request::CreateSnapshot { doc_id, content }).await? {
            Reply::Created(outcome) => Ok(outcome),
            _ => Err(ProtocolError::UnexpectedReply("create_snapshot").into()),
        }
    }

    async fn put_snapshot(
        &self,
        doc_id: Uuid,
        content: String,
    ) -> Result<SnapshotRecord, StoreError> {
        match self.request(Request::PutSnapshot { doc_id, content }).await? {
            Reply::Written(record) => Ok(record),
            _ => Err(ProtocolError::UnexpectedReply("put_snapshot").into()),
        }
    }

    async fn watch_snapshot(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<SnapshotRecord>, StoreError> {
        // Subscribe locally first so nothing forwarded after the relay-side
        // watch opens is missed
        let rx = self.shared.rooms.get_or_create(doc_id).await.watch_snapshots();
        self.ensure_subscribed(doc_id, Channel::Snapshot).await?;
        Ok(rx)
    }

    async fn upsert_presence(
        &self,
        doc_id: Uuid,
        record: PresenceRecord,
    ) -> Result<(), StoreError> {
        match self.request(Request::UpsertPresence { doc_id, record }).await? {
            Reply::Done => Ok(()),
            _ => Err(ProtocolError::UnexpectedReply("upsert_presence").into()),
        }
    }

    async fn remove_presence(&self, doc_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        match self.request(Request::RemovePresence { doc_id, user_id }).await? {
            Reply::Done => Ok(()),
            _ => Err(ProtocolError::UnexpectedReply("remove_presence").into()),
        }
    }

    async fn list_presence(&self, doc_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError> {
        match self.request(Request::ListPresence { doc_id }).await? {
            Reply::Presence(records) => Ok(records),
            _ => Err(ProtocolError::UnexpectedReply("list_presence").into()),
        }
    }

    async fn watch_presence(
        &self,
        doc_id: Uuid,
    ) -> Result<broadcast::Receiver<PresenceEvent>, StoreError> {
        let rx = self.shared.rooms.get_or_create(doc_id).await.watch_presence();
        self.ensure_subscribed(doc_id, Channel::Presence).await?;
        Ok(rx)
    }

    async fn next_version(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        match self.request(Request::NextVersion { doc_id }).await? {
            Reply::Version(version) => Ok(version),
            _ => Err(ProtocolError::UnexpectedReply("next_version").into()),
        }
    }

    async fn append_history(&self, doc_id: Uuid, entry: HistoryEntry) -> Result<(), StoreError> {
        match self.request(Request::AppendHistory { doc_id, entry }).await? {
            Reply::Done => Ok(()),
            _ => Err(ProtocolError::UnexpectedReply("append_history").into()),
        }
    }

    async fn list_history(&self, doc_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        match self.request(Request::ListHistory { doc_id }).await? {
            Reply::History(entries) => Ok(entries),
            _ => Err(ProtocolError::UnexpectedReply("list_history").into()),
        }
    }

    fn send_cleanup_beacon(&self, doc_id: Uuid, user_id: Uuid) {
        let encoded = match (Frame::Beacon { doc_id, user_id }).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Cleanup beacon for {user_id} not encoded: {e}");
                return;
            }
        };
        if let Err(e) = self.outgoing.try_send(encoded) {
            log::warn!("Cleanup beacon for {user_id} on {doc_id} dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = RelayClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = RelayStore::connect(&format!("ws://127.0.0.1:{port}"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
