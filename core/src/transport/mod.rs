//! Transport Module
//!
//! Peer-to-peer channels used once a path has been negotiated.

pub mod cursor;
pub mod direct;
pub mod events;
pub mod frame;
pub mod pending;
pub mod reliable;

// Re-exports for convenience
pub use cursor::{Outcome, ReceiveCursor};
pub use direct::DirectChannel;
pub use events::{EventForwarder, MessageHandler, SessionEvent};
pub use frame::{Frame, FrameError};
pub use pending::{PendingMessage, PendingTable, HANDSHAKE_ID};
pub use reliable::ReliableChannel;
