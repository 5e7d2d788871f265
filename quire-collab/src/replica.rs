//! Local CRDT replica.
//!
//! One `Replica` exists per open document per session. It owns a Yrs `Doc`
//! holding a single `Text` and is the only place merge math happens.
//!
//! ```text
//!  editing surface                 SyncTransport
//!        │ LocalOp                      │ remote bytes
//!        ▼                              ▼
//!  apply_local_op()            apply_remote_update(.., Remote)
//!        │                              │
//!        └──────────► Yrs Doc ◄─────────┘
//!                        │
//!                        ▼
//!              ReplicaChange { origin }  ──► subscribers (autosave, …)
//! ```
//!
//! Notifications are only emitted for applies that changed state, so a
//! re-delivered snapshot (including our own echoed push) is silent.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

/// Name of the shared text type inside the Yrs document.
const CONTENT_TEXT_NAME: &str = "content";

/// A replica shared between the editing surface and the sync tasks.
pub type SharedReplica = Arc<Mutex<Replica>>;

/// Where a state change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The local editing surface.
    Local,
    /// A snapshot delivered by the remote store.
    Remote,
}

/// Emitted after every state-changing apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaChange {
    pub origin: Origin,
    /// Replica revision after the change.
    pub revision: u64,
}

/// Result of merging foreign bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New state was merged.
    Applied,
    /// The bytes were already contained locally.
    Unchanged,
    /// The bytes could not be decoded or merged. Already logged.
    Rejected,
}

/// A local edit from the editing surface. Indices count characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOp {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    /// Replace the whole content, expressed as a minimal splice.
    Replace { text: String },
}

impl LocalOp {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        LocalOp::Insert { index, text: text.into() }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        LocalOp::Delete { index, len }
    }

    pub fn replace(text: impl Into<String>) -> Self {
        LocalOp::Replace { text: text.into() }
    }
}

/// The local CRDT document.
pub struct Replica {
    doc: Doc,
    text: TextRef,
    /// State vector at the last `encode_update` call.
    last_encoded: StateVector,
    /// Bumped on every state-changing apply.
    revision: u64,
    listeners: Vec<mpsc::UnboundedSender<ReplicaChange>>,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        // Offsets are converted from characters to bytes in `byte_offset`.
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Self {
            doc,
            text,
            last_encoded: StateVector::default(),
            revision: 0,
            listeners: Vec::new(),
        }
    }

    /// Create an empty replica wrapped for sharing.
    pub fn shared() -> SharedReplica {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReplicaChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    /// Apply an edit from the editing surface.
    ///
    /// Returns `true` if the document changed; subscribers are notified
    /// before this returns.
    pub fn apply_local_op(&mut self, op: &LocalOp) -> bool {
        let current = self.content();
        let changed = match op {
            LocalOp::Insert { index, text } => {
                if text.is_empty() {
                    false
                } else {
                    let at = byte_offset(&current, *index);
                    let mut txn = self.doc.transact_mut();
                    self.text.insert(&mut txn, at, text);
                    true
                }
            }
            LocalOp::Delete { index, len } => {
                let start = byte_offset(&current, *index);
                let end = byte_offset(&current, index.saturating_add(*len));
                if end > start {
                    let mut txn = self.doc.transact_mut();
                    self.text.remove_range(&mut txn, start, end - start);
                    true
                } else {
                    false
                }
            }
            LocalOp::Replace { text } => self.splice_to(&current, text),
        };

        if changed {
            self.notify(Origin::Local);
        }
        changed
    }

    /// Merge foreign state.
    ///
    /// Malformed bytes are logged and reported as [`ApplyOutcome::Rejected`];
    /// a single corrupt update never takes the session down.
    pub fn apply_remote_update(&mut self, bytes: &[u8], origin: Origin) -> ApplyOutcome {
        let update = match Update::decode_v1(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Rejected undecodable update ({} bytes): {e}", bytes.len());
                return ApplyOutcome::Rejected;
            }
        };

        let (sv_before, content_before) = {
            let txn = self.doc.transact();
            (txn.state_vector(), self.text.get_string(&txn))
        };

        {
            let mut txn = self.doc.transact_mut();
            if let Err(e) = txn.apply_update(update) {
                log::warn!("Rejected unmergeable update ({} bytes): {e}", bytes.len());
                return ApplyOutcome::Rejected;
            }
        }

        // Deletions do not advance the state vector, so compare content too.
        let (sv_after, content_after) = {
            let txn = self.doc.transact();
            (txn.state_vector(), self.text.get_string(&txn))
        };

        if sv_before == sv_after && content_before == content_after {
            return ApplyOutcome::Unchanged;
        }

        self.notify(origin);
        ApplyOutcome::Applied
    }

    /// Minimal bytes covering changes since the previous call.
    pub fn encode_update(&mut self) -> Vec<u8> {
        let txn = self.doc.transact();
        let update = txn.encode_state_as_update_v1(&self.last_encoded);
        self.last_encoded = txn.state_vector();
        update
    }

    /// Complete snapshot, usable to bootstrap a fresh replica.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector (the merge clock).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Render the current text.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Number of characters in the document.
    pub fn char_len(&self) -> usize {
        self.content().chars().count()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace `current` with `target` using the common prefix/suffix splice.
    fn splice_to(&self, current: &str, target: &str) -> bool {
        if current == target {
            return false;
        }

        let old: Vec<char> = current.chars().collect();
        let new: Vec<char> = target.chars().collect();

        let prefix = old.iter().zip(new.iter()).take_while(|(a, b)| a == b).count();
        let max_suffix = (old.len() - prefix).min(new.len() - prefix);
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(max_suffix)
            .count();

        let start = byte_offset(current, prefix as u32);
        let end = byte_offset(current, (old.len() - suffix) as u32);
        let inserted: String = new[prefix..new.len() - suffix].iter().collect();

        let mut txn = self.doc.transact_mut();
        if end > start {
            self.text.remove_range(&mut txn, start, end - start);
        }
        if !inserted.is_empty() {
            self.text.insert(&mut txn, start, &inserted);
        }
        true
    }

    fn notify(&mut self, origin: Origin) {
        self.revision += 1;
        let change = ReplicaChange {
            origin,
            revision: self.revision,
        };
        self.listeners.retain(|tx| tx.send(change).is_ok());
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a character index into the byte offset Yrs expects, clamped to
/// the end of the text.
fn byte_offset(text: &str, char_index: u32) -> u32 {
    let offset = text
        .char_indices()
        .nth(char_index as usize)
        .map_or(text.len(), |(i, _)| i);
    offset as u32
}
