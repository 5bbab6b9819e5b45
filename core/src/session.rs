//! Session Facade
//!
//! What the game talks to: `send`, a [`MessageHandler`] for inbound
//! messages, and `quit`. A session owns exactly one channel, picked once
//! negotiation converges.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::negotiator::{ActivePath, PathNegotiator};
use crate::protocol::Role;
use crate::rendezvous::RendezvousClient;
use crate::resolver::{local_ipv4, resolve_bind_ip, ConnectionCode};
use crate::transport::{DirectChannel, MessageHandler, ReliableChannel};

/// The one channel of a session
pub enum Channel {
    Direct(DirectChannel),
    Reliable(ReliableChannel),
}

impl Channel {
    fn send(&self, payload: &[u8]) -> Result<()> {
        match self {
            Channel::Direct(channel) => channel.send(payload),
            Channel::Reliable(channel) => channel.send(payload),
        }
    }

    fn quit(&self) {
        match self {
            Channel::Direct(channel) => channel.quit(),
            Channel::Reliable(channel) => channel.quit(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            Channel::Direct(channel) => channel.is_open(),
            Channel::Reliable(channel) => channel.is_open(),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        match self {
            Channel::Direct(channel) => channel.peer_addr(),
            Channel::Reliable(channel) => channel.peer_addr(),
        }
    }
}

/// Where a connection attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Resolving,
    Matchmaking,
    Negotiating,
    Ready,
    Failed,
    Cancelled,
}

/// An established two-player session
pub struct Session {
    channel: Channel,
    role: Role,
    peer_name: Option<String>,
}

impl Session {
    /// Resolve, get paired, negotiate a path and start its channel.
    /// Blocks; see [`Session::spawn_connect`] for the background variant.
    pub fn establish(
        config: &NetConfig,
        display_name: &str,
        handler: Arc<dyn MessageHandler>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        Self::establish_with(config, display_name, handler, running, |_| {})
    }

    fn establish_with(
        config: &NetConfig,
        display_name: &str,
        handler: Arc<dyn MessageHandler>,
        running: Arc<AtomicBool>,
        on_phase: impl Fn(ConnectPhase),
    ) -> Result<Self> {
        on_phase(ConnectPhase::Resolving);
        let bind_ip = resolve_bind_ip(config.bind_ip)?;

        on_phase(ConnectPhase::Matchmaking);
        let (pairing, local_addr) = {
            let mut client = RendezvousClient::open(
                config.rendezvous_addr,
                bind_ip,
                config.rendezvous_timeout(),
            )?;
            let ticket = client.ticket(display_name);
            (client.connect(&ticket, &running)?, client.local_addr())
        };

        on_phase(ConnectPhase::Negotiating);
        let negotiator = PathNegotiator::new(config.clone(), local_addr, running);
        let path = negotiator.negotiate(&pairing)?;

        let session = Self::from_path(
            path,
            pairing.role(),
            Some(pairing.peer_name),
            config,
            handler,
        )?;
        on_phase(ConnectPhase::Ready);
        Ok(session)
    }

    /// Run [`Session::establish`] on its own thread so the caller's event
    /// loop keeps running.
    pub fn spawn_connect(
        config: NetConfig,
        display_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Connecting {
        let running = Arc::new(AtomicBool::new(true));
        let phase = Arc::new(Mutex::new(ConnectPhase::Resolving));
        let display_name = display_name.to_string();

        let handle = {
            let running = running.clone();
            let phase = phase.clone();
            thread::spawn(move || {
                let set_phase = |p: ConnectPhase| {
                    *phase.lock().unwrap_or_else(PoisonError::into_inner) = p;
                };
                let result = Self::establish_with(
                    &config,
                    &display_name,
                    handler,
                    running,
                    &set_phase,
                );
                match &result {
                    Ok(_) => {}
                    Err(NetError::Cancelled) => set_phase(ConnectPhase::Cancelled),
                    Err(e) => {
                        tracing::error!("Connection attempt failed: {}", e);
                        set_phase(ConnectPhase::Failed);
                    }
                }
                result
            })
        };

        Connecting {
            running,
            phase,
            handle: Some(handle),
        }
    }

    /// Wrap a negotiated path in the matching channel.
    pub fn from_path(
        path: ActivePath,
        role: Role,
        peer_name: Option<String>,
        config: &NetConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let channel = match path {
            ActivePath::Stream(stream) => {
                Channel::Direct(DirectChannel::start(stream, config, handler)?)
            }
            ActivePath::Datagram {
                socket,
                peer,
                confirmation,
            } => Channel::Reliable(ReliableChannel::start(
                socket,
                peer,
                Some(confirmation),
                config,
                handler,
            )?),
        };
        Ok(Session {
            channel,
            role,
            peer_name,
        })
    }

    /// Host a direct LAN game; the guest joins with our [`ConnectionCode`].
    pub fn host_direct(
        config: &NetConfig,
        handler: Arc<dyn MessageHandler>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let ip = resolve_bind_ip(config.bind_ip)?;
        let negotiator =
            PathNegotiator::new(config.clone(), SocketAddr::new(ip, config.lan_port), running);
        let stream = negotiator.accept_one(SocketAddr::new(ip, config.lan_port))?;
        Self::from_path(ActivePath::Stream(stream), Role::Host, None, config, handler)
    }

    /// Join a direct LAN game from the host's connection code.
    pub fn join_direct(
        config: &NetConfig,
        code: &ConnectionCode,
        handler: Arc<dyn MessageHandler>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let target = SocketAddr::new(code.ip().into(), config.lan_port);
        let negotiator = PathNegotiator::new(config.clone(), target, running);
        let stream = negotiator.connect_to(target)?;
        Self::from_path(ActivePath::Stream(stream), Role::Guest, None, config, handler)
    }

    /// Code to show the other player when hosting directly
    pub fn direct_code(config: &NetConfig) -> Result<ConnectionCode> {
        let ip = match config.bind_ip {
            Some(std::net::IpAddr::V4(ip)) => ip,
            Some(other) => {
                return Err(NetError::AddressUnavailable(format!(
                    "{} cannot be written as a code",
                    other
                )))
            }
            None => local_ipv4()?,
        };
        Ok(ConnectionCode::new(ip))
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.channel.send(payload)
    }

    /// Tear the channel down. Idempotent.
    pub fn quit(&self) {
        self.channel.quit();
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    /// True when running over the hole-punched reliability layer
    pub fn is_reliable(&self) -> bool {
        matches!(self.channel, Channel::Reliable(_))
    }
}

/// Handle to a connection attempt running in the background
pub struct Connecting {
    running: Arc<AtomicBool>,
    phase: Arc<Mutex<ConnectPhase>>,
    handle: Option<JoinHandle<Result<Session>>>,
}

impl Connecting {
    pub fn phase(&self) -> ConnectPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop matchmaking or hole punching. The server is told to drop our
    /// request if we were still waiting for a partner.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Block until the attempt ends
    pub fn wait(mut self) -> Result<Session> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "connect thread panicked",
                )))
            }),
            None => Err(NetError::Cancelled),
        }
    }
}

impl Drop for Connecting {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;
    use std::time::Duration;

    fn loopback_config() -> NetConfig {
        let mut config = NetConfig::default();
        config.bind_ip = Some("127.0.0.1".parse().unwrap());
        config.lan_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        config
    }

    #[test]
    fn test_direct_code_from_override() {
        let config = loopback_config();
        let code = Session::direct_code(&config).unwrap();
        assert_eq!(code.ip(), std::net::Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_direct_host_and_join() {
        let config = loopback_config();
        let (tx, rx) = mpsc::channel::<Bytes>();
        let tx = Mutex::new(tx);
        let host_handler: Arc<dyn MessageHandler> = Arc::new(move |p: Bytes| {
            let _ = tx.lock().unwrap().send(p);
        });

        let host_config = config.clone();
        let host = thread::spawn(move || {
            Session::host_direct(&host_config, host_handler, Arc::new(AtomicBool::new(true)))
        });

        let code = Session::direct_code(&config).unwrap();
        let guest = Session::join_direct(
            &config,
            &code,
            Arc::new(|_: Bytes| {}),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        let host = host.join().unwrap().unwrap();

        assert_eq!(host.role(), Role::Host);
        assert_eq!(guest.role(), Role::Guest);
        assert!(!guest.is_reliable());

        guest.send(b"start").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&got[..], b"start");

        guest.quit();
        host.quit();
        assert!(guest.send(b"quit").is_ok());
    }

    #[test]
    fn test_spawn_connect_unreachable_server() {
        let mut config = loopback_config();
        // nothing listens here once the probe listener is dropped
        config.rendezvous_addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let connecting = Session::spawn_connect(config, "Escargot", Arc::new(|_: Bytes| {}));
        let result = connecting.wait();
        assert!(matches!(result, Err(NetError::ServerUnreachable(_))));
    }
}
