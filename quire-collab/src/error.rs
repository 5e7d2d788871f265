//! Error taxonomy for the replication core.
//!
//! ```text
//! StoreError ──(map at transport boundary)──► SyncError
//!                                               │
//!               ┌───────────────────────────────┼──────────────────────────┐
//!               ▼                               ▼                          ▼
//!       TransportUnavailable            PermissionDenied        MalformedRemoteState
//!       (retried w/ backoff)            (fatal, not retried)    (logged, skipped)
//! ```
//!
//! Only content-save failures reach `SaveStatus`. History and presence
//! failures are logged by their owners and go no further.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the session components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network or store connectivity failure. Retried with backoff.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Capability or auth failure. Fatal for the session.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Corrupt or undecodable remote snapshot.
    #[error("Malformed remote state: {0}")]
    MalformedRemoteState(String),

    #[error("History write failed: {0}")]
    HistoryWriteFailed(String),

    #[error("Presence publish failed: {0}")]
    PresencePublishFailed(String),

    /// The session (or one of its tasks) has already been torn down.
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether retrying the same operation could ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_))
    }

    /// Whether this error should halt automatic saving.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, SyncError::PermissionDenied(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PermissionDenied(msg) => SyncError::PermissionDenied(msg),
            StoreError::DeserializationError(msg) => SyncError::MalformedRemoteState(msg),
            other => SyncError::TransportUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let denied: SyncError = StoreError::PermissionDenied("read-only".into()).into();
        assert_eq!(denied, SyncError::PermissionDenied("read-only".into()));
        assert!(denied.is_forbidden());
        assert!(!denied.is_retryable());

        let offline: SyncError = StoreError::Unavailable("connection reset".into()).into();
        assert!(offline.is_retryable());
        assert!(offline.to_string().contains("connection reset"));

        let corrupt: SyncError = StoreError::DeserializationError("bad frame".into()).into();
        assert!(matches!(corrupt, SyncError::MalformedRemoteState(_)));
    }

    #[test]
    fn test_side_channel_errors_not_retryable() {
        assert!(!SyncError::HistoryWriteFailed("x".into()).is_retryable());
        assert!(!SyncError::PresencePublishFailed("x".into()).is_retryable());
        assert!(!SyncError::SessionClosed.is_retryable());
    }
}
