//! WebSocket relay hosting a [`RemoteStore`] for many clients.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── forwarder(doc, snapshot) ──┐
//!            ├── connection task ────┤                              ├──► Notify frames
//! Client B ──┘        │              └── forwarder(doc, presence) ──┘
//!                     ▼
//!               Arc<dyn RemoteStore>  (MemoryStore or RocksStore)
//! ```
//!
//! Each connection handles its requests in arrival order. Subscriptions
//! spawn one forwarder per (document, channel) that turns store
//! notifications into `Notify` frames on that connection.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 3 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::protocol::{Frame, Notification, Reply, Request};
use crate::presence::PresenceEvent;
use crate::store::{RemoteStore, StoreError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Notifications buffered per connection before forwarders wait
    pub outgoing_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outgoing_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outgoing_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_notifications: u64,
    pub total_beacons: u64,
    /// Frames that failed to decode or were not valid from a client.
    pub rejected_frames: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    total_notifications: AtomicU64,
    total_beacons: AtomicU64,
    rejected_frames: AtomicU64,
}

impl AtomicRelayStats {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_notifications: self.total_notifications.load(Ordering::Relaxed),
            total_beacons: self.total_beacons.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Snapshot,
    Presence,
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    store: Arc<dyn RemoteStore>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let store = self.store.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outgoing_capacity;

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);

                if let Err(e) =
                    Self::handle_connection(stream, addr, store, stats.clone(), capacity).await
                {
                    log::debug!("Connection {addr} ended with error: {e}");
                }

                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                log::info!("Client {addr} disconnected");
            });
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<dyn RemoteStore>,
        stats: Arc<AtomicRelayStats>,
        capacity: usize,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(capacity.max(1));
        let mut forwarders: HashMap<(Uuid, Channel), JoinHandle<()>> = HashMap::new();

        let result: ConnectionResult = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                                Ok(Frame::Request { id, body }) => {
                                    stats.total_requests.fetch_add(1, Ordering::Relaxed);
                                    log::trace!("{addr} → {} {}", body.name(), body.doc_id());
                                    let result =
                                        Self::dispatch(&store, body, &notify_tx, &mut forwarders)
                                            .await;
                                    let encoded = Frame::Response { id, result }.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                                Ok(Frame::Beacon { doc_id, user_id }) => {
                                    stats.total_beacons.fetch_add(1, Ordering::Relaxed);
                                    if let Err(e) = store.remove_presence(doc_id, user_id).await {
                                        log::warn!("Cleanup beacon for {user_id} on {doc_id} failed: {e}");
                                    }
                                }
                                Ok(other) => {
                                    stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Unexpected frame from {addr}: {other:?}");
                                }
                                Err(e) => {
                                    stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                }
                            },
                            Some(Ok(Message::Ping(payload))) => {
                                ws_sender.send(Message::Pong(payload)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::debug!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    Some(notification) = notify_rx.recv() => {
                        stats.total_notifications.fetch_add(1, Ordering::Relaxed);
                        let encoded = Frame::Notify(notification).encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                }
            }
            ConnectionResult::Ok(())
        }
        .await;

        for (_, forwarder) in forwarders {
            forwarder.abort();
        }
        result
    }

    /// Run one request against the hosted store.
    async fn dispatch(
        store: &Arc<dyn RemoteStore>,
        body: Request,
        notify_tx: &mpsc::Sender<Notification>,
        forwarders: &mut HashMap<(Uuid, Channel), JoinHandle<()>>,
    ) -> Result<Reply, StoreError> {
        match body {
            Request::GetSnapshot { doc_id } => store.get_snapshot(doc_id).await.map(Reply::Snapshot),
            Request::CreateSnapshot { doc_id, content } => store
                .create_snapshot_if_absent(doc_id, content)
                .await
                .map(Reply::Created),
            Request::PutSnapshot { doc_id, content } => {
                store.put_snapshot(doc_id, content).await.map(Reply::Written)
            }
            Request::SubscribeSnapshot { doc_id } => {
                if Self::is_forwarding(forwarders, doc_id, Channel::Snapshot) {
                    return Ok(Reply::Done);
                }
                let rx = store.watch_snapshot(doc_id).await?;
                let task = tokio::spawn(forward_snapshots(
                    doc_id,
                    rx,
                    store.clone(),
                    notify_tx.clone(),
                ));
                forwarders.insert((doc_id, Channel::Snapshot), task);
                Ok(Reply::Done)
            }
            Request::UpsertPresence { doc_id, record } => {
                store.upsert_presence(doc_id, record).await.map(|_| Reply::Done)
            }
            Request::RemovePresence { doc_id, user_id } => {
                store.remove_presence(doc_id, user_id).await.map(|_| Reply::Done)
            }
            Request::ListPresence { doc_id } => {
                store.list_presence(doc_id).await.map(Reply::Presence)
            }
            Request::SubscribePresence { doc_id } => {
                if Self::is_forwarding(forwarders, doc_id, Channel::Presence) {
                    return Ok(Reply::Done);
                }
                let rx = store.watch_presence(doc_id).await?;
                let task = tokio::spawn(forward_presence(
                    doc_id,
                    rx,
                    store.clone(),
                    notify_tx.clone(),
                ));
                forwarders.insert((doc_id, Channel::Presence), task);
                Ok(Reply::Done)
            }
            Request::NextVersion { doc_id } => store.next_version(doc_id).await.map(Reply::Version),
            Request::AppendHistory { doc_id, entry } => {
                store.append_history(doc_id, entry).await.map(|_| Reply::Done)
            }
            Request::ListHistory { doc_id } => {
                store.list_history(doc_id).await.map(Reply::History)
            }
        }
    }

    fn is_forwarding(
        forwarders: &HashMap<(Uuid, Channel), JoinHandle<()>>,
        doc_id: Uuid,
        channel: Channel,
    ) -> bool {
        forwarders
            .get(&(doc_id, channel))
            .is_some_and(|task| !task.is_finished())
    }
}

// ─── Forwarders ─────────────────────────────────────────────────────

async fn forward_snapshots(
    doc_id: Uuid,
    mut rx: broadcast::Receiver<crate::store::SnapshotRecord>,
    store: Arc<dyn RemoteStore>,
    tx: mpsc::Sender<Notification>,
) {
    loop {
        let record = match rx.recv().await {
            Ok(record) => record,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Only the latest record matters
                log::debug!("Snapshot forwarder for {doc_id} skipped {missed}, re-reading");
                match store.get_snapshot(doc_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("Re-read of {doc_id} after lag failed: {e}");
                        continue;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if tx.send(Notification::Snapshot { doc_id, record }).await.is_err() {
            break;
        }
    }
}

async fn forward_presence(
    doc_id: Uuid,
    mut rx: broadcast::Receiver<PresenceEvent>,
    store: Arc<dyn RemoteStore>,
    tx: mpsc::Sender<Notification>,
) {
    loop {
        let events = match rx.recv().await {
            Ok(event) => vec![event],
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Missed removals are left to the clients' stale sweep
                log::debug!("Presence forwarder for {doc_id} skipped {missed}, re-listing");
                match store.list_presence(doc_id).await {
                    Ok(records) => records.into_iter().map(PresenceEvent::Upserted).collect(),
                    Err(e) => {
                        log::warn!("Re-list of {doc_id} presence failed: {e}");
                        continue;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for event in events {
            if tx.send(Notification::Presence { doc_id, event }).await.is_err() {
                return;
            }
        }
    }
}
