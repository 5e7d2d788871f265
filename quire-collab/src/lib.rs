//! # quire-collab: Document replication core for Quire
//!
//! Keeps one text document converged across sessions through a shared
//! snapshot store, saves automatically, shows who else is editing, and
//! records a version history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   whole-state    ┌──────────────────────┐
//! │ DocumentSession      │ ◄──────────────► │ RemoteStore          │
//! │  Replica (Yrs Doc)   │   snapshots      │  MemoryStore         │
//! │  SyncTransport       │                  │  RocksStore          │
//! │  AutosaveController  │ ── presence ───► │  RelayStore ══╗      │
//! │  PresenceTracker     │ ── history ────► │               ║      │
//! │  HistoryRecorder     │                  └───────────────╫──────┘
//! └──────────────────────┘                                  ▼
//!                                                    RelayServer
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: Yrs-backed mergeable text with origin-tagged change events
//! - [`sync`]: Snapshot transport with bootstrap, push and remote merge
//! - [`autosave`]: Debounce/max-interval/retry state machine and its driver
//! - [`presence`]: Collaborator list with heartbeats and stale sweep
//! - [`history`]: Append-only version entries with coarse diff summaries
//! - [`session`]: Per-document context wiring the above together
//! - [`store`]: `RemoteStore` trait, in-memory and RocksDB stores
//! - [`relay`]: WebSocket relay server and client store
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

pub mod autosave;
pub mod config;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod presence;
pub mod relay;
pub mod replica;
pub mod session;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use autosave::{
    AllowAll, AutosaveController, AutosaveMachine, PermissionCheck, SaveErrorKind, SaveState,
    SaveStatus, SavedEvent,
};
pub use config::{AutosaveConfig, PresenceConfig, SessionConfig};
pub use error::SyncError;
pub use history::{ChangeType, HistoryEntry, HistoryRecorder};
pub use lifecycle::{LifecycleEvent, LifecycleSource};
pub use presence::{
    CollaboratorInfo, CursorColor, CursorPosition, PresenceEvent, PresenceRecord,
    PresenceTracker, UserIdentity,
};
pub use relay::{RelayConfig, RelayServer, RelayStore};
pub use replica::{ApplyOutcome, LocalOp, Origin, Replica, ReplicaChange, SharedReplica};
pub use session::{DocumentSession, SessionBuilder};
pub use store::{
    CreateOutcome, MemoryStore, RemoteStore, RocksStore, SnapshotRecord, StoreConfig, StoreError,
};
pub use sync::{SyncSubscription, SyncTransport, TransportState};
