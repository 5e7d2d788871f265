//! Per-document session context.
//!
//! A [`DocumentSession`] owns everything one open document needs: the
//! replica, the sync transport, and the autosave, presence and history
//! tasks. Nothing is global; two sessions in one process are independent.
//!
//! ```text
//!                       ┌──────────────── DocumentSession ────────────────┐
//!  on_local_edit(op) ──►│ Replica ──change──► AutosaveController ──push──►│──► RemoteStore
//!                       │    ▲                      │ SavedEvent          │
//!                       │    └── SyncTransport ◄────┼─────────────────────│◄── watch_snapshot
//!                       │                           ▼                     │
//!                       │                    HistoryRecorder ────────────►│──► history/{vN}
//!                       │  PresenceTracker ──────────────────────────────►│──► collaborators/{uid}
//!                       └─────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autosave::{AllowAll, AutosaveController, PermissionCheck, SaveStatus};
use crate::config::SessionConfig;
use crate::error::SyncError;
use crate::history::{HistoryEntry, HistoryRecorder};
use crate::lifecycle::LifecycleSource;
use crate::presence::{CollaboratorInfo, CursorPosition, PresenceTracker, UserIdentity};
use crate::replica::{LocalOp, Replica, SharedReplica};
use crate::store::RemoteStore;
use crate::sync::{SyncSubscription, SyncTransport, TransportState};

/// Builder for [`DocumentSession`].
pub struct SessionBuilder {
    doc_id: Uuid,
    user: UserIdentity,
    store: Arc<dyn RemoteStore>,
    config: SessionConfig,
    permission: Arc<dyn PermissionCheck>,
    lifecycle: Option<LifecycleSource>,
}

impl SessionBuilder {
    pub fn new(doc_id: Uuid, user: UserIdentity, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            doc_id,
            user,
            store,
            config: SessionConfig::default(),
            permission: Arc::new(AllowAll),
            lifecycle: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Checked before every push.
    pub fn permission(mut self, permission: Arc<dyn PermissionCheck>) -> Self {
        self.permission = permission;
        self
    }

    /// Share a lifecycle source with the editing surface. Without one the
    /// session creates its own, reachable through [`DocumentSession::lifecycle`].
    pub fn lifecycle(mut self, lifecycle: LifecycleSource) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Load or bootstrap the document and start the background tasks.
    ///
    /// Fails if the remote record cannot be read or created. Presence
    /// failures are logged and leave the session without a collaborator list.
    pub async fn open(self) -> Result<DocumentSession, SyncError> {
        let SessionBuilder {
            doc_id,
            user,
            store,
            config,
            permission,
            lifecycle,
        } = self;
        let lifecycle = lifecycle.unwrap_or_default();

        let replica = Replica::shared();
        let changes = replica.lock().await.subscribe();

        let transport = SyncTransport::new(doc_id, replica.clone(), store.clone());
        let subscription = transport.start().await?;

        let autosave = AutosaveController::spawn(
            config.autosave.clone(),
            transport.clone(),
            permission,
            user.user_id,
            changes,
            lifecycle.subscribe(),
        );

        let history = HistoryRecorder::new(doc_id, user.clone(), store.clone())
            .spawn(autosave.subscribe_saved());

        let presence = match PresenceTracker::spawn(
            doc_id,
            user.clone(),
            store.clone(),
            config.presence.clone(),
            lifecycle.subscribe(),
        )
        .await
        {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                log::warn!("{}", SyncError::PresencePublishFailed(e.to_string()));
                None
            }
        };

        log::info!("Opened document {doc_id} for {} ({})", user.name, user.user_id);

        Ok(DocumentSession {
            doc_id,
            user,
            store,
            replica,
            transport,
            lifecycle,
            subscription: Some(subscription),
            autosave: Some(autosave),
            presence,
            history: Some(history),
        })
    }
}

/// One open document for one user.
pub struct DocumentSession {
    doc_id: Uuid,
    user: UserIdentity,
    store: Arc<dyn RemoteStore>,
    replica: SharedReplica,
    transport: Arc<SyncTransport>,
    lifecycle: LifecycleSource,
    subscription: Option<SyncSubscription>,
    autosave: Option<AutosaveController>,
    presence: Option<PresenceTracker>,
    history: Option<JoinHandle<()>>,
}

impl DocumentSession {
    /// Open with default configuration.
    pub async fn open(
        doc_id: Uuid,
        user: UserIdentity,
        store: Arc<dyn RemoteStore>,
    ) -> Result<Self, SyncError> {
        SessionBuilder::new(doc_id, user, store).open().await
    }

    pub fn builder(doc_id: Uuid, user: UserIdentity, store: Arc<dyn RemoteStore>) -> SessionBuilder {
        SessionBuilder::new(doc_id, user, store)
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Apply an edit from the editing surface. Returns `true` if it changed
    /// the document (and so will be saved).
    pub async fn on_local_edit(&self, op: LocalOp) -> bool {
        self.replica.lock().await.apply_local_op(&op)
    }

    /// Current rendered text.
    pub async fn content(&self) -> String {
        self.replica.lock().await.content()
    }

    /// The shared replica, for editing surfaces that render from it directly.
    pub fn replica(&self) -> SharedReplica {
        self.replica.clone()
    }

    pub fn save_status(&self) -> watch::Receiver<SaveStatus> {
        match &self.autosave {
            Some(autosave) => autosave.status(),
            None => watch::channel(SaveStatus::initial()).1,
        }
    }

    pub fn collaborators(&self) -> watch::Receiver<Vec<CollaboratorInfo>> {
        match &self.presence {
            Some(presence) => presence.collaborators(),
            None => watch::channel(Vec::new()).1,
        }
    }

    pub fn set_cursor(&self, cursor: Option<CursorPosition>) {
        if let Some(presence) = &self.presence {
            presence.set_cursor(cursor);
        }
    }

    /// Save now. Also resumes saving after a `Forbidden` error.
    pub fn flush(&self) {
        if let Some(autosave) = &self.autosave {
            autosave.flush();
        }
    }

    /// Emit focus/blur/unload events into this session.
    pub fn lifecycle(&self) -> &LifecycleSource {
        &self.lifecycle
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub async fn wait_synced(&self) -> Result<(), SyncError> {
        self.transport.wait_synced().await
    }

    /// History entries of this document, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, SyncError> {
        Ok(self.store.list_history(self.doc_id).await?)
    }

    /// Tear down: finish saving, record history, leave presence, unsubscribe.
    pub async fn close(mut self) {
        if let Some(mut autosave) = self.autosave.take() {
            autosave.shutdown().await;
        }
        // With the autosave controller gone the saved channel closes and the
        // recorder drains what is left
        if let Some(history) = self.history.take() {
            let _ = history.await;
        }
        if let Some(mut presence) = self.presence.take() {
            presence.shutdown().await;
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.stop();
        }
        log::info!("Closed document {} for {}", self.doc_id, self.user.user_id);
    }
}
