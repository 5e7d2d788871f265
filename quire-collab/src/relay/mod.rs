//! WebSocket relay: a [`RemoteStore`](crate::store::RemoteStore) shared by
//! many client processes.
//!
//! ```text
//!  DocumentSession ── RelayStore ══ WebSocket ══ RelayServer ── MemoryStore / RocksStore
//!  DocumentSession ── RelayStore ══ WebSocket ══════╝
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ConnectionState, RelayClientConfig, RelayStore};
pub use protocol::{Frame, Notification, ProtocolError, Reply, Request};
pub use server::{RelayConfig, RelayServer, RelayStats};
