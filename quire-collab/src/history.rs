//! Version history: one immutable entry per content-changing save.
//!
//! ```text
//!  SavedEvent ──► content == previous_content? ──yes──► skip
//!                     │ no
//!                     ▼
//!               next_version()          (atomic counter, per document)
//!                     │
//!                     ▼
//!               append_history(vN)      (fails on reuse, never overwrites)
//! ```
//!
//! `previous_content` is the newest stored text the transport knew of before
//! the write, whoever wrote it, so a save that leaves the stored text as it
//! was records nothing and a second author's first save diffs against the
//! first author's text.
//!
//! Versions are strictly increasing per document. A failed append leaves a
//! gap, which is allowed; a duplicate never happens because the counter only
//! moves forward. Failures are logged and never reach the save path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autosave::SavedEvent;
use crate::error::SyncError;
use crate::presence::UserIdentity;
use crate::store::RemoteStore;

/// Coarse classification of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// First non-empty content of the document.
    Created,
    /// Content got longer.
    Expanded,
    /// Content got shorter.
    Trimmed,
    /// Same length, different text.
    Revised,
}

/// The `history/{version}` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub author_id: Uuid,
    pub author_name: String,
    pub change_type: ChangeType,
    pub diff_summary: String,
}

/// Summarize the change from `previous` to `current` by character count.
pub fn summarize(previous: &str, current: &str) -> (ChangeType, String) {
    if previous.is_empty() {
        return (ChangeType::Created, "Initial content created".to_string());
    }

    let before = previous.chars().count();
    let after = current.chars().count();
    if after > before {
        (
            ChangeType::Expanded,
            format!("Added {} characters", after - before),
        )
    } else if after < before {
        (
            ChangeType::Trimmed,
            format!("Removed {} characters", before - after),
        )
    } else {
        (
            ChangeType::Revised,
            "Modified content (length unchanged)".to_string(),
        )
    }
}

/// Records history entries for one document on behalf of one author.
pub struct HistoryRecorder {
    doc_id: Uuid,
    author: UserIdentity,
    store: Arc<dyn RemoteStore>,
}

impl HistoryRecorder {
    pub fn new(doc_id: Uuid, author: UserIdentity, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            doc_id,
            author,
            store,
        }
    }

    /// Record a save that replaced `previous` with `content`. Returns the
    /// entry, or `None` if the text did not change.
    pub async fn record(
        &self,
        previous: &str,
        content: &str,
    ) -> Result<Option<HistoryEntry>, SyncError> {
        if content == previous {
            return Ok(None);
        }

        let version = self
            .store
            .next_version(self.doc_id)
            .await
            .map_err(|e| SyncError::HistoryWriteFailed(e.to_string()))?;

        let (change_type, diff_summary) = summarize(previous, content);
        let entry = HistoryEntry {
            version,
            timestamp: Utc::now(),
            author_id: self.author.user_id,
            author_name: self.author.name.clone(),
            change_type,
            diff_summary,
        };

        self.store
            .append_history(self.doc_id, entry.clone())
            .await
            .map_err(|e| SyncError::HistoryWriteFailed(e.to_string()))?;

        log::debug!("Recorded v{version} of {}: {}", self.doc_id, entry.diff_summary);
        Ok(Some(entry))
    }

    /// Consume saved events until the autosave controller goes away.
    pub fn spawn(self, mut saved: broadcast::Receiver<SavedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match saved.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.record(&event.previous_content, &event.content).await {
                            log::warn!("{e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Each event carries its own previous text
                        log::debug!("History for {} skipped {missed} save(s)", self.doc_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
