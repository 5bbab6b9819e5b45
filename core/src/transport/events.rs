//! Delivery of inbound messages to the application
//!
//! Channels call their handler from the listener thread, so implementations
//! must treat every call as asynchronous.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NetError;

/// Receives messages from a channel's listener thread
pub trait MessageHandler: Send + Sync + 'static {
    /// One call per distinct application message, in send order
    fn on_receive(&self, payload: Bytes);

    /// The channel stopped because of a socket failure or the peer closing.
    /// Not called after an explicit `quit()`.
    fn on_disconnect(&self, error: &NetError) {
        tracing::debug!("Unhandled disconnect: {}", error);
    }
}

impl<F> MessageHandler for F
where
    F: Fn(Bytes) + Send + Sync + 'static,
{
    fn on_receive(&self, payload: Bytes) {
        self(payload)
    }
}

/// Events pushed to async consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Data received from the peer
    Message(Bytes),
    /// Channel failed; the session is over
    Disconnected(String),
}

/// Handler forwarding everything into a tokio channel
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventForwarder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventForwarder { tx }, rx)
    }
}

impl MessageHandler for EventForwarder {
    fn on_receive(&self, payload: Bytes) {
        if self.tx.send(SessionEvent::Message(payload)).is_err() {
            tracing::debug!("Event receiver dropped, discarding message");
        }
    }

    fn on_disconnect(&self, error: &NetError) {
        let _ = self.tx.send(SessionEvent::Disconnected(error.to_string()));
    }
}
