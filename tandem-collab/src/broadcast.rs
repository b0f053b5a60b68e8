//! Fan-out from one session to its members with backpressure.
//!
//! Each member owns a bounded outbox (`mpsc`), drained by its connection
//! task. A message is encoded once and the same `Arc<str>` is handed to
//! every recipient.
//!
//! A member whose outbox is full is evicted rather than skipped: dropping a
//! single operation would leave that member at a revision gap forever, while
//! an eviction closes its socket and the reconnect resyncs it wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::ClientId;
use crate::session::Outbound;

/// Sender half of a member's outbox. Frames are pre-encoded JSON text.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub evictions: u64,
    pub active_members: usize,
}

/// The delivery side of one session.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    /// Join order is irrelevant here; ordering lives in each outbox.
    members: HashMap<ClientId, Outbox>,
    messages_sent: u64,
    frames_delivered: u64,
    evictions: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, id: ClientId, outbox: Outbox) {
        self.members.insert(id, outbox);
    }

    pub fn remove_member(&mut self, id: &ClientId) -> Option<Outbox> {
        self.members.remove(id)
    }

    pub fn has_member(&self, id: &ClientId) -> bool {
        self.members.contains_key(id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Deliver a batch produced by the session reducer.
    ///
    /// Returns the members evicted because their outbox was full or closed.
    /// They are already removed from the group; the caller must still
    /// remove them from the session.
    pub fn deliver(&mut self, batch: &[Outbound]) -> Vec<ClientId> {
        let mut evicted = Vec::new();

        for outbound in batch {
            let frame: Arc<str> = match outbound.message.encode() {
                Ok(text) => text.into(),
                Err(e) => {
                    log::error!("Dropping {} frame: {e}", outbound.message.kind());
                    continue;
                }
            };
            self.messages_sent += 1;

            for (id, outbox) in &self.members {
                if !outbound.to.includes(id) || evicted.contains(id) {
                    continue;
                }
                match outbox.try_send(frame.clone()) {
                    Ok(()) => self.frames_delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Outbox of {id} is full, evicting");
                        evicted.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::debug!("Outbox of {id} is closed, evicting");
                        evicted.push(*id);
                    }
                }
            }
        }

        for id in &evicted {
            self.members.remove(id);
            self.evictions += 1;
        }
        evicted
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            frames_delivered: self.frames_delivered,
            evictions: self.evictions,
            active_members: self.members.len(),
        }
    }
}
