//! Snaildash Net Library
//! Peer rendezvous, hole punching and reliable messaging for two-player games

pub mod config;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod rendezvous;
pub mod resolver;
pub mod session;
pub mod transport;

pub use config::NetConfig;
pub use error::{NetError, Result};
pub use protocol::{PairingResult, RendezvousTicket, Role};
pub use session::{ConnectPhase, Connecting, Session};
pub use transport::{EventForwarder, MessageHandler, SessionEvent};

/// Initialize the library (logging)
pub fn init() {
    // The game may already have installed a subscriber; keep theirs.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("Snaildash net initialized (logger ready)");
}
