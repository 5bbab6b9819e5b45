//! Transport configuration
//!
//! Loaded from the same `config.json` the game ships with. Every field has a
//! default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Port used by direct (code based) LAN play
pub const DEFAULT_LAN_PORT: u16 = 46953;

/// Default introduction server port
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 46954;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Introduction server address
    pub rendezvous_addr: SocketAddr,
    /// Overrides the address resolver (multi-homed hosts, tests)
    pub bind_ip: Option<IpAddr>,
    pub lan_port: u16,
    /// Read timeout while waiting to be paired
    pub rendezvous_timeout_ms: u64,
    /// Receive timeout of one hole punching round
    pub punch_poll_ms: u64,
    /// Give up hole punching after this long. `None` keeps trying until cancelled.
    pub punch_timeout_ms: Option<u64>,
    /// Retransmission period of the reliable channel
    pub resend_interval_ms: u64,
    /// Listener poll interval; bounds how long shutdown takes to be observed
    pub recv_timeout_ms: u64,
    pub lan_connect_timeout_ms: u64,
    /// Soft frame size budget; larger frames are sent with a warning
    pub max_datagram: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            rendezvous_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                DEFAULT_RENDEZVOUS_PORT,
            ),
            bind_ip: None,
            lan_port: DEFAULT_LAN_PORT,
            rendezvous_timeout_ms: 2000,
            punch_poll_ms: 100,
            punch_timeout_ms: None,
            resend_interval_ms: 100,
            recv_timeout_ms: 100,
            lan_connect_timeout_ms: 10_000,
            max_datagram: 2048,
        }
    }
}

impl NetConfig {
    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        tracing::info!("Loaded transport config from {}", path.display());
        Ok(config)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn punch_poll(&self) -> Duration {
        Duration::from_millis(self.punch_poll_ms)
    }

    pub fn punch_timeout(&self) -> Option<Duration> {
        self.punch_timeout_ms.map(Duration::from_millis)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn lan_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.lan_connect_timeout_ms)
    }
}
