//! Error types shared by every layer of the transport.

use std::io;
use thiserror::Error;

/// Errors surfaced to the caller of the transport.
///
/// Receive timeouts and foreign frames never show up here; they are handled
/// inside the listener loops.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Rendezvous server unreachable: {0}")]
    ServerUnreachable(#[source] io::Error),
    #[error("Matchmaking cancelled before pairing")]
    Cancelled,
    #[error("Malformed pairing message: {0}")]
    MalformedPairing(String),
    #[error("Could not reach peer: {0}")]
    PeerUnreachable(#[source] io::Error),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Hole punching did not converge within {0} ms")]
    PunchTimeout(u64),
    #[error("Message of {0} bytes does not fit in one datagram")]
    MessageTooLarge(usize),
    #[error("Invalid connection code: {0}")]
    InvalidCode(String),
    #[error("Could not determine local address: {0}")]
    AddressUnavailable(String),
    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
