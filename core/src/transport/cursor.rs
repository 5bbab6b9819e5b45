//! Receive-side state machine of the reliable channel.
//!
//! [`ReceiveCursor`] decides, for every inbound `msg` frame, what to hand to
//! the application and which control frames to send back:
//!
//! - the next expected id is delivered, then acknowledged;
//! - an id already delivered is acknowledged again and dropped;
//! - an id beyond a gap is held back and a `res` for the **oldest** missing
//!   id is sent, one gap at a time.
//!
//! Only the listener thread touches the cursor, so it carries no lock. All
//! socket I/O is the caller's responsibility.

use bytes::Bytes;
use std::collections::BTreeMap;

use super::frame::Frame;

/// What to do with one inbound message
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Payloads to hand to the application, in id order
    pub deliver: Vec<Bytes>,
    /// Control frames to send back to the peer
    pub replies: Vec<Frame>,
}

#[derive(Debug)]
pub struct ReceiveCursor {
    last_contiguous: i64,
    highest_seen: i64,
    /// Frames that arrived ahead of a gap
    held: BTreeMap<i64, Bytes>,
}

impl Default for ReceiveCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveCursor {
    pub fn new() -> Self {
        ReceiveCursor {
            last_contiguous: -1,
            highest_seen: -1,
            held: BTreeMap::new(),
        }
    }

    /// Highest id such that every id up to it has been delivered
    pub fn last_contiguous(&self) -> i64 {
        self.last_contiguous
    }

    pub fn highest_seen(&self) -> i64 {
        self.highest_seen
    }

    /// Process an inbound `msg` frame.
    pub fn on_msg(&mut self, id: i64, payload: Bytes) -> Outcome {
        let mut outcome = Outcome::default();
        let expected = self.last_contiguous + 1;

        if id > expected {
            self.highest_seen = self.highest_seen.max(id);
            self.held.entry(id).or_insert(payload);
            outcome.replies.push(Frame::Res(expected));
            return outcome;
        }

        if id < expected {
            outcome.replies.push(Frame::Ack(id));
            return outcome;
        }

        self.accept(id, payload, &mut outcome);

        // Drain whatever was waiting behind the gap we just closed
        while let Some(payload) = self.held.remove(&(self.last_contiguous + 1)) {
            let next = self.last_contiguous + 1;
            self.accept(next, payload, &mut outcome);
        }

        if self.last_contiguous < self.highest_seen {
            outcome.replies.push(Frame::Res(self.last_contiguous + 1));
        }
        outcome
    }

    fn accept(&mut self, id: i64, payload: Bytes, outcome: &mut Outcome) {
        outcome.deliver.push(payload);
        outcome.replies.push(Frame::Ack(id));
        self.highest_seen = self.highest_seen.max(id);
        self.last_contiguous = id;
    }
}
