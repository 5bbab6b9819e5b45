//! Snaildash Wire Protocol Definitions
//!
//! Text formats exchanged with the introduction server and the hole punching
//! probes exchanged between peers. Fields are separated by `|`.

use std::net::{IpAddr, SocketAddr};

use crate::error::{NetError, Result};

pub const DELIMITER: u8 = b'|';

/// Keepalive sent by the introduction server while it looks for a partner
pub const KEEPALIVE: &[u8] = b"ping";

/// Withdraws a pending matchmaking request
pub const CANCEL: &[u8] = b"cancel";

/// Matchmaking request sent once to the introduction server
/// `<privateIP>|<privatePort>|<displayName>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousTicket {
    pub private_addr: SocketAddr,
    pub display_name: String,
}

impl RendezvousTicket {
    pub fn new(private_addr: SocketAddr, display_name: &str) -> Self {
        Self {
            private_addr,
            display_name: display_name.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}",
            self.private_addr.ip(),
            self.private_addr.port(),
            self.display_name
        )
        .into_bytes()
    }
}

/// Which side moves first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

/// Pairing announcement from the introduction server
/// `<isHost>|<isLAN>|<publicIP>|<publicPort>|<privateIP>|<privatePort>|<peerName>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResult {
    pub is_host: bool,
    pub is_lan: bool,
    pub peer_public: SocketAddr,
    pub peer_private: SocketAddr,
    pub peer_name: String,
}

impl PairingResult {
    pub fn role(&self) -> Role {
        if self.is_host {
            Role::Host
        } else {
            Role::Guest
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| NetError::MalformedPairing("not utf-8".to_string()))?;
        let text = text.trim_end_matches(&['\r', '\n'][..]);

        // The name is last so it may itself contain the delimiter
        let fields: Vec<&str> = text.splitn(7, DELIMITER as char).collect();
        if fields.len() != 7 {
            return Err(NetError::MalformedPairing(format!(
                "expected 7 fields, got {}",
                fields.len()
            )));
        }

        Ok(PairingResult {
            is_host: parse_flag(fields[0])?,
            is_lan: parse_flag(fields[1])?,
            peer_public: parse_addr(fields[2], fields[3])?,
            peer_private: parse_addr(fields[4], fields[5])?,
            peer_name: fields[6].to_string(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.is_host as u8,
            self.is_lan as u8,
            self.peer_public.ip(),
            self.peer_public.port(),
            self.peer_private.ip(),
            self.peer_private.port(),
            self.peer_name
        )
        .into_bytes()
    }
}

fn parse_flag(field: &str) -> Result<bool> {
    match field {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(NetError::MalformedPairing(format!("bad flag {:?}", other))),
    }
}

fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| NetError::MalformedPairing(format!("bad address {:?}", ip)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetError::MalformedPairing(format!("bad port {:?}", port)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Which of the peer's advertised addresses a probe was aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Private,
    Public,
}

/// Hole punching datagram, `handshake-priv|0` .. `handshake-pub|1`.
/// Tag 0 is an initial probe, tag 1 echoes a probe back on the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub route: Route,
    pub reply: bool,
}

impl Probe {
    pub fn initial(route: Route) -> Self {
        Probe {
            route,
            reply: false,
        }
    }

    pub fn echo(self) -> Self {
        Probe {
            route: self.route,
            reply: true,
        }
    }

    pub fn encode(&self) -> &'static [u8] {
        match (self.route, self.reply) {
            (Route::Private, false) => b"handshake-priv|0",
            (Route::Private, true) => b"handshake-priv|1",
            (Route::Public, false) => b"handshake-pub|0",
            (Route::Public, true) => b"handshake-pub|1",
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let probe = match buf {
            b"handshake-priv|0" => Probe::initial(Route::Private),
            b"handshake-priv|1" => Probe::initial(Route::Private).echo(),
            b"handshake-pub|0" => Probe::initial(Route::Public),
            b"handshake-pub|1" => Probe::initial(Route::Public).echo(),
            _ => return None,
        };
        Some(probe)
    }
}
