//! Client-side document synchronizer.
//!
//! The server's serialized order is ground truth. The client keeps two
//! views of the text:
//!
//! ```text
//! confirmed  ── server content at `revision` (identical on every client)
//!     │
//!     │  replay pending ops positionally (no transform)
//!     ▼
//! local      ── what the user sees and edits
//! ```
//!
//! Remote operations apply verbatim to `confirmed`. Acks fold the oldest
//! pending op into `confirmed` with the same clamping the sequencer uses.
//! That keeps `confirmed` byte-identical to the server at every revision.

use std::collections::VecDeque;

use thiserror::Error;

use crate::operation::{diff, ApplyError, TextOperation};

/// The local copy no longer matches the server's history.
///
/// The only recovery is a full `session-state` resync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DivergenceError {
    #[error("expected revision {expected}, received {received}")]
    RevisionGap { expected: u64, received: u64 },
    #[error("acknowledgement for revision {0} with no pending operation")]
    UnexpectedAck(u64),
    #[error("remote operation did not apply: {0}")]
    Apply(#[from] ApplyError),
}

#[derive(Debug, Clone, Default)]
pub struct DocumentSync {
    confirmed: String,
    local: String,
    revision: u64,
    pending: VecDeque<TextOperation>,
}

impl DocumentSync {
    pub fn new(content: impl Into<String>, revision: u64) -> Self {
        let content = content.into();
        Self {
            local: content.clone(),
            confirmed: content,
            revision,
            pending: VecDeque::new(),
        }
    }

    /// Diff a local edit against the visible text and queue it.
    ///
    /// Returns the operation to send, or `None` if nothing changed.
    pub fn local_edit(&mut self, new_content: &str) -> Option<TextOperation> {
        let edit = diff(&self.local, new_content)?;
        let op = TextOperation::new(edit, self.revision);
        self.pending.push_back(op.clone());
        self.local = new_content.to_string();
        Some(op)
    }

    /// Apply an operation broadcast by the sequencer.
    ///
    /// Returns `Ok(false)` for a stale duplicate that was already applied.
    pub fn on_remote_operation(
        &mut self,
        op: &TextOperation,
        revision: u64,
    ) -> Result<bool, DivergenceError> {
        if revision <= self.revision {
            return Ok(false);
        }
        self.expect_next(revision)?;
        self.confirmed = op.edit.apply(&self.confirmed)?;
        self.revision = revision;
        self.rebuild_local();
        Ok(true)
    }

    /// The sequencer accepted our oldest pending operation at `revision`.
    pub fn on_ack(&mut self, revision: u64) -> Result<(), DivergenceError> {
        self.expect_next(revision)?;
        let op = self
            .pending
            .pop_front()
            .ok_or(DivergenceError::UnexpectedAck(revision))?;
        self.confirmed = op.edit.apply_clamped(&self.confirmed);
        self.revision = revision;
        Ok(())
    }

    /// Replace everything with a server snapshot. Unacked edits are dropped.
    pub fn reset(&mut self, content: impl Into<String>, revision: u64) {
        let content = content.into();
        self.local = content.clone();
        self.confirmed = content;
        self.revision = revision;
        self.pending.clear();
    }

    /// Visible text, including unacknowledged local edits.
    pub fn content(&self) -> &str {
        &self.local
    }

    /// Server content as of [`Self::revision`].
    pub fn confirmed(&self) -> &str {
        &self.confirmed
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn expect_next(&self, revision: u64) -> Result<(), DivergenceError> {
        let expected = self.revision + 1;
        if revision != expected {
            return Err(DivergenceError::RevisionGap { expected, received: revision });
        }
        Ok(())
    }

    fn rebuild_local(&mut self) {
        self.local = self
            .pending
            .iter()
            .fold(self.confirmed.clone(), |text, op| op.edit.apply_clamped(&text));
    }
}
