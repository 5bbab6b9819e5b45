//! Local address discovery and connection codes
//!
//! The outward-facing address is what the peer (or the introduction server)
//! should use to reach us. A connection code is the same IPv4 address
//! written in base 36 so players can read it to each other.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;

use local_ip_address::local_ip;

use crate::error::{NetError, Result};

const CODE_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Public address used only to pick a route; nothing is sent to it.
const PROBE_TARGET: ([u8; 4], u16) = ([8, 8, 8, 8], 80);

/// Find the local IPv4 address other machines can reach us on.
///
/// Asks the OS interface table first, then falls back to connecting an
/// unbound UDP socket towards a public address and reading which local
/// address the kernel picked.
pub fn local_ipv4() -> Result<Ipv4Addr> {
    match local_ip() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() => return Ok(ip),
        Ok(other) => {
            tracing::debug!("Interface lookup returned {}, trying route probe", other)
        }
        Err(e) => tracing::debug!("Interface lookup failed: {}, trying route probe", e),
    }
    route_probe()
}

fn route_probe() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    socket
        .connect(SocketAddr::from(PROBE_TARGET))
        .map_err(|e| NetError::AddressUnavailable(e.to_string()))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(NetError::AddressUnavailable(format!(
            "route probe gave {}",
            other
        ))),
    }
}

/// Resolve the address to bind to, honoring an explicit override.
pub fn resolve_bind_ip(override_ip: Option<IpAddr>) -> Result<IpAddr> {
    match override_ip {
        Some(ip) => Ok(ip),
        None => local_ipv4().map(IpAddr::V4),
    }
}

/// Base-36 encoding of an IPv4 address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCode {
    ip: Ipv4Addr,
}

impl ConnectionCode {
    pub fn new(ip: Ipv4Addr) -> Self {
        ConnectionCode { ip }
    }

    /// Decode a user-entered code. Case insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let mut n: u64 = 0;
        for c in s.bytes() {
            let digit = CODE_ALPHABET
                .iter()
                .position(|&a| a == c.to_ascii_uppercase())? as u64;
            n = n.checked_mul(36)?.checked_add(digit)?;
            if n > u32::MAX as u64 {
                return None;
            }
        }
        Some(ConnectionCode {
            ip: Ipv4Addr::from(n as u32),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Code for display
    pub fn display(&self) -> String {
        let mut n = u32::from(self.ip);
        let mut digits = Vec::new();
        loop {
            digits.push(CODE_ALPHABET[(n % 36) as usize]);
            n /= 36;
            if n == 0 {
                break;
            }
        }
        digits.reverse();
        String::from_utf8_lossy(&digits).into_owned()
    }
}

impl FromStr for ConnectionCode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| NetError::InvalidCode(s.to_string()))
    }
}

impl std::fmt::Display for ConnectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}
