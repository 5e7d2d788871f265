//! Autosave: decides when local edits are pushed.
//!
//! Split in two:
//!
//! - [`AutosaveMachine`] is the pure state machine. Events in, actions out,
//!   no clocks and no I/O.
//! - [`AutosaveController`] is the driver task. It owns the timers, runs the
//!   pushes, and publishes [`SaveStatus`].
//!
//! ```text
//!                   LocalChange                 DebounceElapsed
//!        ┌──────┐ ─────────────► ┌────────────┐ ───────────────► ┌────────┐
//!        │ Idle │                │ Debouncing │  MaxInterval/Blur │ Saving │
//!        └──────┘ ◄───────────── └────────────┘ ───────────────► └────────┘
//!           ▲       PushSucceeded                                  │    │ LocalChange
//!           └──────────────────────────────────────────────────────┘    ▼
//!                                                           ┌──────────────┐
//!                    RetryElapsed ┌──────────────┐          │ SavingQueued │
//!             Saving ◄─────────── │ ErrorBackoff │          └──────────────┘
//!                                 └──────────────┘            │ PushSucceeded
//!                 PushFailed(transient) ▲                     ▼
//!                                                           Saving (again)
//!        PushFailed(forbidden) ──► Halted ──(flush)──► Saving
//! ```
//!
//! Pushes are never concurrent: the driver holds at most one in-flight push
//! and every push encodes the full state at the moment it starts.

use std::future::pending;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use crate::config::AutosaveConfig;
use crate::error::SyncError;
use crate::lifecycle::{LifecycleEvent, recv_or_pending};
use crate::replica::{Origin, ReplicaChange};
use crate::store::SnapshotRecord;
use crate::sync::{PushReceipt, SyncTransport};

// ───────────────────────────────────────────────────────────────────
// State machine
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutosaveState {
    /// Everything saved.
    Idle,
    /// Waiting for a quiet period.
    Debouncing,
    /// One push in flight.
    Saving,
    /// One push in flight and newer edits waiting.
    SavingQueued,
    /// Last push failed transiently; a retry is scheduled.
    ErrorBackoff,
    /// Last push was forbidden. Only an explicit flush resumes saving.
    Halted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutosaveEvent {
    LocalChange,
    DebounceElapsed,
    /// Unsaved edits have been waiting for the max interval.
    MaxIntervalElapsed,
    Blur,
    FlushRequested,
    PushSucceeded,
    PushFailed { forbidden: bool },
    RetryElapsed,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutosaveAction {
    StartDebounce,
    CancelDebounce,
    StartPush,
    /// Schedule the retry for the n-th consecutive failure.
    ScheduleRetry(u32),
    CancelRetry,
}

/// Pure autosave transition function.
#[derive(Debug, Clone)]
pub struct AutosaveMachine {
    state: AutosaveState,
    /// Local edits not yet carried by a push that started.
    dirty: bool,
    /// Consecutive transient failures.
    failures: u32,
}

impl Default for AutosaveMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AutosaveMachine {
    pub fn new() -> Self {
        Self {
            state: AutosaveState::Idle,
            dirty: false,
            failures: 0,
        }
    }

    pub fn state(&self) -> AutosaveState {
        self.state
    }

    /// Whether local edits exist that no successful or running push carries.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the max-interval timer should be running.
    pub fn max_interval_armed(&self) -> bool {
        self.dirty && matches!(self.state, AutosaveState::Idle | AutosaveState::Debouncing)
    }

    pub fn handle(&mut self, event: AutosaveEvent) -> Vec<AutosaveAction> {
        use AutosaveAction::*;
        use AutosaveState::*;

        match (self.state, event) {
            (Closed, AutosaveEvent::PushFailed { .. }) => {
                self.dirty = true;
                vec![]
            }
            (Closed, _) => vec![],

            (_, AutosaveEvent::Close) => {
                self.state = Closed;
                vec![CancelDebounce, CancelRetry]
            }

            // ── Local edits ──────────────────────────────────────
            (Idle | Debouncing, AutosaveEvent::LocalChange) => {
                self.dirty = true;
                self.state = Debouncing;
                vec![StartDebounce]
            }
            (Saving | SavingQueued, AutosaveEvent::LocalChange) => {
                self.dirty = true;
                self.state = SavingQueued;
                vec![]
            }
            (ErrorBackoff | Halted, AutosaveEvent::LocalChange) => {
                // The pending retry (or the next flush) carries these edits
                self.dirty = true;
                vec![]
            }

            // ── Triggers ─────────────────────────────────────────
            (Debouncing, AutosaveEvent::DebounceElapsed) => self.start_push(vec![]),
            (Idle | Debouncing, AutosaveEvent::MaxIntervalElapsed) if self.dirty => {
                self.start_push(vec![CancelDebounce])
            }
            (Idle | Debouncing, AutosaveEvent::Blur | AutosaveEvent::FlushRequested)
                if self.dirty =>
            {
                self.start_push(vec![CancelDebounce])
            }
            (ErrorBackoff, AutosaveEvent::Blur | AutosaveEvent::FlushRequested) => {
                self.start_push(vec![CancelRetry])
            }
            (ErrorBackoff, AutosaveEvent::RetryElapsed) => self.start_push(vec![]),
            (Halted, AutosaveEvent::FlushRequested) => {
                if self.dirty {
                    self.start_push(vec![])
                } else {
                    self.state = Idle;
                    vec![]
                }
            }

            // ── Push results ─────────────────────────────────────
            (Saving, AutosaveEvent::PushSucceeded) => {
                self.failures = 0;
                self.state = Idle;
                vec![]
            }
            (SavingQueued, AutosaveEvent::PushSucceeded) => {
                self.failures = 0;
                self.start_push(vec![])
            }
            (Saving | SavingQueued, AutosaveEvent::PushFailed { forbidden: true }) => {
                self.dirty = true;
                self.failures = 0;
                self.state = Halted;
                vec![]
            }
            (Saving | SavingQueued, AutosaveEvent::PushFailed { forbidden: false }) => {
                self.dirty = true;
                self.failures = self.failures.saturating_add(1);
                self.state = ErrorBackoff;
                vec![ScheduleRetry(self.failures)]
            }

            _ => vec![],
        }
    }

    fn start_push(&mut self, mut actions: Vec<AutosaveAction>) -> Vec<AutosaveAction> {
        self.dirty = false;
        self.state = AutosaveState::Saving;
        actions.push(AutosaveAction::StartPush);
        actions
    }
}

// ───────────────────────────────────────────────────────────────────
// Status read model
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveErrorKind {
    /// Will be retried automatically.
    Transient,
    /// Needs new credentials; not retried.
    Forbidden,
}

/// What the UI shows next to the document title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveStatus {
    pub state: SaveState,
    pub message: Option<String>,
    pub error_kind: Option<SaveErrorKind>,
    pub last_saved: Option<DateTime<Utc>>,
}

impl SaveStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: SaveState::Saved,
            message: None,
            error_kind: None,
            last_saved: None,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.error_kind == Some(SaveErrorKind::Forbidden)
    }
}

/// Emitted after every successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedEvent {
    pub doc_id: Uuid,
    /// Rendered text that was saved.
    pub content: String,
    /// Text of the newest stored record before this save.
    pub previous_content: String,
    pub record: SnapshotRecord,
}

// ───────────────────────────────────────────────────────────────────
// Permission check
// ───────────────────────────────────────────────────────────────────

/// Asked before every push. A `false` is reported as `Forbidden`.
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn can_write(&self, doc_id: Uuid, user_id: Uuid) -> bool;
}

/// Grants every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionCheck for AllowAll {
    async fn can_write(&self, _doc_id: Uuid, _user_id: Uuid) -> bool {
        true
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

enum AutosaveCommand {
    Flush,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the autosave task of one session.
pub struct AutosaveController {
    commands: mpsc::UnboundedSender<AutosaveCommand>,
    status: watch::Receiver<SaveStatus>,
    saved: broadcast::Sender<SavedEvent>,
    task: Option<JoinHandle<()>>,
}

type PushHandle = JoinHandle<Result<PushReceipt, SyncError>>;

struct AutosaveTask {
    config: AutosaveConfig,
    transport: Arc<SyncTransport>,
    permission: Arc<dyn PermissionCheck>,
    user_id: Uuid,
    machine: AutosaveMachine,
    status: watch::Sender<SaveStatus>,
    saved: broadcast::Sender<SavedEvent>,
    in_flight: Option<PushHandle>,
    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
    /// When the oldest unsaved edit was made.
    unsaved_since: Option<Instant>,
}

impl AutosaveController {
    /// Start the task. `changes` must be a replica subscription; only
    /// `Local` changes are acted on.
    pub fn spawn(
        config: AutosaveConfig,
        transport: Arc<SyncTransport>,
        permission: Arc<dyn PermissionCheck>,
        user_id: Uuid,
        changes: mpsc::UnboundedReceiver<ReplicaChange>,
        lifecycle: broadcast::Receiver<LifecycleEvent>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(SaveStatus::initial());
        let (saved_tx, _) = broadcast::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = AutosaveTask {
            config,
            transport,
            permission,
            user_id,
            machine: AutosaveMachine::new(),
            status: status_tx,
            saved: saved_tx.clone(),
            in_flight: None,
            debounce_at: None,
            retry_at: None,
            unsaved_since: None,
        };
        let handle = tokio::spawn(task.run(changes, lifecycle, cmd_rx));

        Self {
            commands: cmd_tx,
            status: status_rx,
            saved: saved_tx,
            task: Some(handle),
        }
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.status.clone()
    }

    pub fn subscribe_saved(&self) -> broadcast::Receiver<SavedEvent> {
        self.saved.subscribe()
    }

    /// Push now if anything is unsaved. Also resumes a halted controller.
    pub fn flush(&self) {
        let _ = self.commands.send(AutosaveCommand::Flush);
    }

    /// Wait for an in-flight push, push once more if edits remain, stop.
    pub async fn shutdown(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(AutosaveCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutosaveController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn run_push(
    transport: Arc<SyncTransport>,
    permission: Arc<dyn PermissionCheck>,
    user_id: Uuid,
) -> Result<PushReceipt, SyncError> {
    let doc_id = transport.doc_id();
    if !permission.can_write(doc_id, user_id).await {
        return Err(SyncError::PermissionDenied(format!(
            "user {user_id} may not write document {doc_id}"
        )));
    }
    transport.push().await
}

impl AutosaveTask {
    async fn run(
        mut self,
        changes: mpsc::UnboundedReceiver<ReplicaChange>,
        lifecycle: broadcast::Receiver<LifecycleEvent>,
        mut commands: mpsc::UnboundedReceiver<AutosaveCommand>,
    ) {
        let mut changes = Some(changes);
        let mut lifecycle = Some(lifecycle);

        loop {
            let max_at = if self.machine.max_interval_armed() {
                self.unsaved_since.map(|t| t + self.config.max_interval)
            } else {
                None
            };

            tokio::select! {
                change = async {
                    match changes.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => pending().await,
                    }
                } => match change {
                    Some(ReplicaChange { origin: Origin::Local, .. }) => {
                        self.unsaved_since.get_or_insert_with(Instant::now);
                        self.dispatch(AutosaveEvent::LocalChange);
                    }
                    Some(_) => {}
                    None => changes = None,
                },

                _ = sleep_until_opt(self.debounce_at) => {
                    self.debounce_at = None;
                    self.dispatch(AutosaveEvent::DebounceElapsed);
                }

                _ = sleep_until_opt(max_at) => {
                    log::debug!("Max autosave interval reached, forcing push");
                    self.dispatch(AutosaveEvent::MaxIntervalElapsed);
                }

                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.dispatch(AutosaveEvent::RetryElapsed);
                }

                result = async {
                    match self.in_flight.as_mut() {
                        Some(handle) => handle.await,
                        None => pending().await,
                    }
                } => {
                    self.in_flight = None;
                    let result = result.unwrap_or_else(|e| {
                        Err(SyncError::TransportUnavailable(format!("push task failed: {e}")))
                    });
                    self.finish_push(result);
                }

                event = recv_or_pending(&mut lifecycle) => match event {
                    Ok(LifecycleEvent::Blur | LifecycleEvent::Unload) => {
                        self.dispatch(AutosaveEvent::Blur);
                    }
                    Ok(LifecycleEvent::Focus) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => lifecycle = None,
                },

                command = commands.recv() => match command {
                    Some(AutosaveCommand::Flush) => self.dispatch(AutosaveEvent::FlushRequested),
                    Some(AutosaveCommand::Shutdown(done)) => {
                        self.drain_changes(&mut changes);
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.drain_changes(&mut changes);
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
    }

    /// Pick up edits made just before shutdown.
    fn drain_changes(&mut self, changes: &mut Option<mpsc::UnboundedReceiver<ReplicaChange>>) {
        let Some(rx) = changes.as_mut() else {
            return;
        };
        while let Ok(change) = rx.try_recv() {
            if matches!(change.origin, Origin::Local) {
                self.unsaved_since.get_or_insert_with(Instant::now);
                self.dispatch(AutosaveEvent::LocalChange);
            }
        }
    }

    fn dispatch(&mut self, event: AutosaveEvent) {
        let actions = self.machine.handle(event);
        log::trace!("Autosave {event:?} -> {:?} {actions:?}", self.machine.state());

        for action in actions {
            match action {
                AutosaveAction::StartDebounce => {
                    self.debounce_at = Some(Instant::now() + self.config.debounce);
                }
                AutosaveAction::CancelDebounce => self.debounce_at = None,
                AutosaveAction::StartPush => self.start_push(),
                AutosaveAction::ScheduleRetry(attempt) => {
                    let delay = self.config.retry_delay(attempt);
                    log::debug!("Autosave retry #{attempt} in {delay:?}");
                    self.retry_at = Some(Instant::now() + delay);
                }
                AutosaveAction::CancelRetry => self.retry_at = None,
            }
        }
    }

    fn start_push(&mut self) {
        self.status.send_modify(|status| {
            status.state = SaveState::Saving;
            status.message = None;
            status.error_kind = None;
        });
        self.in_flight = Some(tokio::spawn(run_push(
            self.transport.clone(),
            self.permission.clone(),
            self.user_id,
        )));
    }

    fn finish_push(&mut self, result: Result<PushReceipt, SyncError>) {
        match result {
            Ok(receipt) => {
                if !self.machine.is_dirty() {
                    self.unsaved_since = None;
                }
                self.report_saved(receipt);
                self.dispatch(AutosaveEvent::PushSucceeded);
            }
            Err(e) => {
                self.report_failed(&e);
                self.dispatch(AutosaveEvent::PushFailed {
                    forbidden: e.is_forbidden(),
                });
            }
        }
    }

    fn report_saved(&self, receipt: PushReceipt) {
        let saved_at = receipt.record.updated_at;
        self.status.send_replace(SaveStatus {
            state: SaveState::Saved,
            message: None,
            error_kind: None,
            last_saved: Some(saved_at),
        });
        let _ = self.saved.send(SavedEvent {
            doc_id: self.transport.doc_id(),
            content: receipt.content,
            previous_content: receipt.previous_content,
            record: receipt.record,
        });
    }

    fn report_failed(&self, e: &SyncError) {
        let kind = if e.is_forbidden() {
            SaveErrorKind::Forbidden
        } else {
            SaveErrorKind::Transient
        };
        log::error!("Save of {} failed: {e}", self.transport.doc_id());
        self.status.send_modify(|status| {
            status.state = SaveState::Error;
            status.message = Some(e.to_string());
            status.error_kind = Some(kind);
        });
    }

    /// Wait out the in-flight push, then push once more if edits remain.
    /// A refused in-flight push halts the session, so no final push follows.
    async fn teardown(&mut self) {
        let mut halted = self.machine.state() == AutosaveState::Halted;
        self.dispatch(AutosaveEvent::Close);

        if let Some(handle) = self.in_flight.take() {
            match handle.await {
                // The write already happened; saved listeners still hear of it
                Ok(Ok(receipt)) => self.report_saved(receipt),
                Ok(Err(e)) => {
                    halted |= e.is_forbidden();
                    self.report_failed(&e);
                    self.machine.handle(AutosaveEvent::PushFailed {
                        forbidden: e.is_forbidden(),
                    });
                }
                Err(e) => {
                    log::warn!("In-flight push aborted during teardown: {e}");
                    self.machine.handle(AutosaveEvent::PushFailed { forbidden: false });
                }
            }
        }

        if self.machine.is_dirty() && !halted {
            log::debug!("Final flush of {}", self.transport.doc_id());
            match run_push(self.transport.clone(), self.permission.clone(), self.user_id).await {
                Ok(receipt) => self.report_saved(receipt),
                Err(e) => self.report_failed(&e),
            }
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use AutosaveAction::*;
    use AutosaveEvent::*;

    fn machine_in(events: &[AutosaveEvent]) -> AutosaveMachine {
        let mut m = AutosaveMachine::new();
        for e in events {
            m.handle(*e);
        }
        m
    }

    #[test]
    fn test_local_change_starts_debounce() {
        let mut m = AutosaveMachine::new();
        assert_eq!(m.handle(LocalChange), vec![StartDebounce]);
        assert_eq!(m.state(), AutosaveState::Debouncing);
        assert!(m.is_dirty());
        // Another edit restarts the timer
        assert_eq!(m.handle(LocalChange), vec![StartDebounce]);
    }

    #[test]
    fn test_debounce_elapsed_pushes() {
        let mut m = machine_in(&[LocalChange]);
        assert_eq!(m.handle(DebounceElapsed), vec![StartPush]);
        assert_eq!(m.state(), AutosaveState::Saving);
        assert!(!m.is_dirty());
    }

    #[test]
    fn test_stale_debounce_ignored() {
        let mut m = AutosaveMachine::new();
        assert!(m.handle(DebounceElapsed).is_empty());
        assert_eq!(m.state(), AutosaveState::Idle);
    }

    #[test]
    fn test_edit_while_saving_queues_one_push() {
        let mut m = machine_in(&[LocalChange, DebounceElapsed]);
        assert!(m.handle(LocalChange).is_empty());
        assert!(m.handle(LocalChange).is_empty());
        assert_eq!(m.state(), AutosaveState::SavingQueued);

        assert_eq!(m.handle(PushSucceeded), vec![StartPush]);
        assert_eq!(m.state(), AutosaveState::Saving);
        assert!(m.handle(PushSucceeded).is_empty());
        assert_eq!(m.state(), AutosaveState::Idle);
    }

    #[test]
    fn test_max_interval_only_when_dirty() {
        let mut m = AutosaveMachine::new();
        assert!(!m.max_interval_armed());
        assert!(m.handle(MaxIntervalElapsed).is_empty());

        let mut m = machine_in(&[LocalChange]);
        assert!(m.max_interval_armed());
        assert_eq!(m.handle(MaxIntervalElapsed), vec![CancelDebounce, StartPush]);
        assert!(!m.max_interval_armed());
    }

    #[test]
    fn test_max_interval_never_while_saving() {
        let mut m = machine_in(&[LocalChange, DebounceElapsed, LocalChange]);
        assert!(!m.max_interval_armed());
        assert!(m.handle(MaxIntervalElapsed).is_empty());
    }

    #[test]
    fn test_blur_pushes_immediately() {
        let mut m = machine_in(&[LocalChange]);
        assert_eq!(m.handle(Blur), vec![CancelDebounce, StartPush]);

        let mut clean = AutosaveMachine::new();
        assert!(clean.handle(Blur).is_empty());
    }

    #[test]
    fn test_transient_failure_backs_off() {
        let mut m = machine_in(&[LocalChange, DebounceElapsed]);
        assert_eq!(m.handle(PushFailed { forbidden: false }), vec![ScheduleRetry(1)]);
        assert_eq!(m.state(), AutosaveState::ErrorBackoff);
        assert!(m.is_dirty());

        assert_eq!(m.handle(RetryElapsed), vec![StartPush]);
        assert_eq!(m.handle(PushFailed { forbidden: false }), vec![ScheduleRetry(2)]);
        assert_eq!(m.handle(RetryElapsed), vec![StartPush]);
        assert!(m.handle(PushSucceeded).is_empty());
        assert_eq!(m.failures(), 0);
        assert_eq!(m.state(), AutosaveState::Idle);
    }

    #[test]
    fn test_edits_during_backoff_wait_for_retry() {
        let mut m = machine_in(&[LocalChange, DebounceElapsed, PushFailed { forbidden: false }]);
        assert!(m.handle(LocalChange).is_empty());
        assert_eq!(m.state(), AutosaveState::ErrorBackoff);
    }

    #[test]
    fn test_forbidden_halts_without_retry() {
        let mut m = machine_in(&[LocalChange, DebounceElapsed]);
        assert!(m.handle(PushFailed { forbidden: true }).is_empty());
        assert_eq!(m.state(), AutosaveState::Halted);

        assert!(m.handle(LocalChange).is_empty());
        assert!(m.handle(DebounceElapsed).is_empty());
        assert!(m.handle(MaxIntervalElapsed).is_empty());
        assert!(m.handle(RetryElapsed).is_empty());
        assert_eq!(m.state(), AutosaveState::Halted);

        assert_eq!(m.handle(FlushRequested), vec![StartPush]);
        assert_eq!(m.state(), AutosaveState::Saving);
    }

    #[test]
    fn test_close_cancels_timers() {
        let mut m = machine_in(&[LocalChange]);
        assert_eq!(m.handle(Close), vec![CancelDebounce, CancelRetry]);
        assert_eq!(m.state(), AutosaveState::Closed);
        assert!(m.is_dirty());
        assert!(m.handle(DebounceElapsed).is_empty());
    }

    #[test]
    fn test_save_status_initial() {
        let status = SaveStatus::initial();
        assert_eq!(status.state, SaveState::Saved);
        assert!(status.last_saved.is_none());
        assert!(!status.is_forbidden());
    }
}
