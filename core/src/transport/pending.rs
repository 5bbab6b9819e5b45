//! Outgoing Message Tracking
//!
//! Sender side state of the reliable channel: id allocation and the frames
//! still waiting for an acknowledgment.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;

/// Id of the handshake confirmation that is retransmitted like a message
/// until the peer acknowledges it. Application ids start at 0.
pub const HANDSHAKE_ID: i64 = -1;

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub frame: Bytes,
    pub acknowledged: bool,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Frames sent but not yet acknowledged, keyed by id
#[derive(Debug, Default)]
pub struct PendingTable {
    next_id: i64,
    entries: BTreeMap<i64, PendingMessage>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next message id
    pub fn alloc_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Id the next [`alloc_id`](Self::alloc_id) call will hand out
    pub fn peek_id(&self) -> i64 {
        self.next_id
    }

    /// Record a sent frame for ack tracking
    pub fn record(&mut self, id: i64, frame: Bytes) {
        self.entries.insert(
            id,
            PendingMessage {
                frame,
                acknowledged: false,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Mark `id` delivered. Returns true only for the first ack of a
    /// pending id.
    pub fn acknowledge(&mut self, id: i64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.acknowledged {
            return false;
        }
        entry.acknowledged = true;
        tracing::trace!(
            "Message {} acknowledged after {:?} and {} retries",
            id,
            entry.sent_at.elapsed(),
            entry.retries
        );
        self.compact();
        true
    }

    /// Stored frame for a repair request, if still unacknowledged
    pub fn frame_for(&mut self, id: i64) -> Option<Bytes> {
        let entry = self.entries.get_mut(&id).filter(|e| !e.acknowledged)?;
        entry.retries += 1;
        Some(entry.frame.clone())
    }

    /// Copy of every unacknowledged frame, oldest first. Bumps retry counters.
    pub fn retransmit_candidates(&mut self) -> Vec<(i64, Bytes)> {
        self.entries
            .iter_mut()
            .filter(|(_, e)| !e.acknowledged)
            .map(|(id, e)| {
                e.retries += 1;
                (*id, e.frame.clone())
            })
            .collect()
    }

    pub fn is_acknowledged(&self, id: i64) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.acknowledged,
            // only acknowledged entries are ever dropped
            None => id < self.next_id && id >= HANDSHAKE_ID,
        }
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.entries.values().filter(|e| !e.acknowledged).count()
    }

    /// Drop acknowledged entries below the oldest unacknowledged one
    fn compact(&mut self) {
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().acknowledged {
                break;
            }
            entry.remove();
        }
    }
}
