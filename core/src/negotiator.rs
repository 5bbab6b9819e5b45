//! Path Negotiation
//!
//! Turns a pairing into a usable connection. Peers on the same LAN get a
//! plain TCP stream; everyone else hole-punches a UDP path.
//!
//! Hole punching probes both advertised addresses of the peer every round
//! and echoes any probe it receives. The first echo received decides the
//! path. There is no deadline unless `punch_timeout_ms` is configured: a
//! punch that never converges keeps the session waiting until it is
//! cancelled.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::NetConfig;
use crate::error::{is_timeout, NetError, Result};
use crate::protocol::{PairingResult, Probe, Route};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Connection produced by negotiation
#[derive(Debug)]
pub enum ActivePath {
    /// Reliable ordered stream (same LAN)
    Stream(TcpStream),
    /// Hole-punched socket, logically bound to `peer`
    Datagram {
        socket: UdpSocket,
        peer: SocketAddr,
        /// Echo that made us converge; resent until the peer acknowledges
        confirmation: Probe,
    },
}

pub struct PathNegotiator {
    config: NetConfig,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl PathNegotiator {
    /// `local_addr` is the address used to reach the rendezvous server.
    pub fn new(config: NetConfig, local_addr: SocketAddr, running: Arc<AtomicBool>) -> Self {
        PathNegotiator {
            config,
            local_addr,
            running,
        }
    }

    pub fn negotiate(&self, pairing: &PairingResult) -> Result<ActivePath> {
        if pairing.is_lan {
            let stream = if pairing.is_host {
                self.accept_one(self.local_addr)?
            } else {
                self.connect_to(pairing.peer_private)?
            };
            return Ok(ActivePath::Stream(stream));
        }

        let (socket, peer, confirmation) =
            self.punch(pairing.peer_private, pairing.peer_public)?;
        Ok(ActivePath::Datagram {
            socket,
            peer,
            confirmation,
        })
    }

    /// Hole punch towards both addresses of the peer.
    pub fn punch(
        &self,
        private: SocketAddr,
        public: SocketAddr,
    ) -> Result<(UdpSocket, SocketAddr, Probe)> {
        let socket = bind_udp_with_reuse(self.local_addr)?;
        socket.set_read_timeout(Some(self.config.punch_poll()))?;
        tracing::info!(
            "Hole punching from {} to {} (private) / {} (public)",
            self.local_addr,
            private,
            public
        );

        let started = Instant::now();
        let deadline = self.config.punch_timeout();
        let mut rounds: u64 = 0;
        let mut buf = [0u8; 64];

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(NetError::Cancelled);
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Err(NetError::PunchTimeout(limit.as_millis() as u64));
                }
            }

            rounds += 1;
            for (route, target) in [(Route::Private, private), (Route::Public, public)] {
                if let Err(e) = socket.send_to(Probe::initial(route).encode(), target) {
                    tracing::debug!("Probe to {} failed: {}", target, e);
                }
            }

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref e) if is_timeout(e) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(NetError::Io(e)),
            };
            if from != private && from != public {
                tracing::debug!("Ignoring datagram from unexpected {}", from);
                continue;
            }

            match Probe::parse(&buf[..len]) {
                Some(probe) if probe.reply => {
                    tracing::info!(
                        "Hole punch converged on {} after {} rounds ({:?})",
                        from,
                        rounds,
                        started.elapsed()
                    );
                    return Ok((socket, from, probe));
                }
                Some(probe) => {
                    tracing::debug!("Echoing {:?} probe from {}", probe.route, from);
                    if let Err(e) = socket.send_to(probe.echo().encode(), from) {
                        tracing::debug!("Echo to {} failed: {}", from, e);
                    }
                }
                None => tracing::debug!("Ignoring non-handshake datagram from {}", from),
            }
        }
    }

    /// Listen on `addr` and accept exactly one peer.
    pub fn accept_one(&self, addr: SocketAddr) -> Result<TcpStream> {
        let listener = bind_listener_with_reuse(addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!("Waiting for the guest on {}", listener.local_addr()?);

        let deadline = Instant::now() + self.config.lan_connect_timeout();
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    tracing::info!("Guest connected from {}", peer);
                    return Ok(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(NetError::PeerUnreachable(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no guest connected",
                        )));
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(NetError::PeerUnreachable(e)),
            }
        }
        Err(NetError::Cancelled)
    }

    /// Connect to the host at `target`.
    ///
    /// Both peers learn about the pairing at the same time, so a refused
    /// connection is retried until the LAN timeout in case the host is not
    /// listening yet.
    pub fn connect_to(&self, target: SocketAddr) -> Result<TcpStream> {
        let deadline = Instant::now() + self.config.lan_connect_timeout();
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(NetError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::PeerUnreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("host {} did not answer", target),
                )));
            }

            match TcpStream::connect_timeout(&target, remaining) {
                Ok(stream) => {
                    tracing::info!("Connected to host {}", target);
                    return Ok(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::debug!("Host {} refused, retrying", target);
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(NetError::PeerUnreachable(e)),
            }
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

fn bind_udp_with_reuse(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn bind_listener_with_reuse(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}
