//! Rendezvous Client
//!
//! Registers with the introduction server and waits to be paired with a
//! second player. The server keeps the connection alive with `ping` while it
//! searches, then sends one pairing line.

use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{is_timeout, NetError, Result};
use crate::protocol::{PairingResult, RendezvousTicket, CANCEL, DELIMITER, KEEPALIVE};

const RECV_BUF_LEN: usize = 2048;

/// How long to wait for the rest of an unterminated peer name
const NAME_SETTLE: Duration = Duration::from_millis(100);

/// Number of `|` separators before the peer name starts
const PAIRING_SEPARATORS: usize = 6;

/// Connection to the introduction server
pub struct RendezvousClient {
    stream: TcpStream,
    local_addr: SocketAddr,
}

impl RendezvousClient {
    /// Connect to the introduction server from `bind_ip`.
    ///
    /// The local socket is bound with address reuse so the hole punching
    /// socket (or the LAN listener) can later take the same address.
    pub fn open(server: SocketAddr, bind_ip: IpAddr, timeout: Duration) -> Result<Self> {
        let domain = match server {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::new(bind_ip, 0).into())?;
        socket
            .connect_timeout(&server.into(), timeout)
            .map_err(NetError::ServerUnreachable)?;

        let stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let local_addr = stream.local_addr()?;

        tracing::info!("Connected to rendezvous server {} from {}", server, local_addr);
        Ok(RendezvousClient { stream, local_addr })
    }

    /// Local end of the server connection; advertised as our private address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ticket(&self, display_name: &str) -> RendezvousTicket {
        RendezvousTicket::new(self.local_addr, display_name)
    }

    /// Send the ticket and block until paired.
    ///
    /// `running` is checked after every read timeout; clearing it withdraws
    /// the request from the server and returns [`NetError::Cancelled`].
    pub fn connect(
        &mut self,
        ticket: &RendezvousTicket,
        running: &AtomicBool,
    ) -> Result<PairingResult> {
        self.stream
            .write_all(&ticket.encode())
            .map_err(NetError::ServerUnreachable)?;
        tracing::info!("Waiting for an opponent as '{}'", ticket.display_name);

        let mut input = PairingReader::default();
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            if !running.load(Ordering::SeqCst) {
                self.cancel();
                return Err(NetError::Cancelled);
            }

            match self.stream.read(&mut buf) {
                Ok(0) => {
                    tracing::error!("Rendezvous server closed the connection");
                    return Err(NetError::ConnectionLost);
                }
                Ok(len) => {
                    input.push(&buf[..len]);
                    if let Some(line) = input.take_line() {
                        return announce(PairingResult::parse(&line)?);
                    }
                    if input.has_name() {
                        let line = self.settle_name(&mut input)?;
                        return announce(PairingResult::parse(&line)?);
                    }
                    tracing::trace!("Waiting for more of the pairing ({} bytes)", input.len());
                }
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => return Err(NetError::ServerUnreachable(e)),
            }
        }
    }

    /// The name is the last field and may be unterminated; collect whatever
    /// else arrives promptly.
    fn settle_name(&mut self, input: &mut PairingReader) -> Result<Bytes> {
        self.stream.set_read_timeout(Some(NAME_SETTLE))?;
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    input.push(&buf[..len]);
                    if let Some(line) = input.take_line() {
                        return Ok(line);
                    }
                }
                Err(ref e) if is_timeout(e) => break,
                Err(e) => return Err(NetError::ServerUnreachable(e)),
            }
        }
        Ok(input.take_rest())
    }

    fn cancel(&mut self) {
        tracing::info!("Withdrawing matchmaking request");
        if let Err(e) = self.stream.write_all(CANCEL) {
            tracing::warn!("Failed to send cancel: {}", e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn announce(pairing: PairingResult) -> Result<PairingResult> {
    tracing::info!(
        "Paired with '{}' (host: {}, lan: {}, public {}, private {})",
        pairing.peer_name,
        pairing.is_host,
        pairing.is_lan,
        pairing.peer_public,
        pairing.peer_private
    );
    Ok(pairing)
}

/// Server input accumulated across reads until a whole pairing line is in.
/// Keepalives in front of the line are skipped.
#[derive(Debug, Default)]
struct PairingReader {
    buf: BytesMut,
}

impl PairingReader {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.skip_keepalives();
    }

    fn skip_keepalives(&mut self) {
        loop {
            let blank = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buf.advance(blank);
            if !self.buf.starts_with(KEEPALIVE) {
                return;
            }
            self.buf.advance(KEEPALIVE.len());
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    /// Line terminated by `\n`, if one has arrived. Anything after it is
    /// discarded.
    fn take_line(&mut self) -> Option<Bytes> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(end).freeze();
        self.buf.clear();
        Some(line)
    }

    /// Every field before the name is complete
    fn has_name(&self) -> bool {
        self.buf.iter().filter(|&&b| b == DELIMITER).count() >= PAIRING_SEPARATORS
    }

    fn take_rest(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reader_skips_keepalives() {
        let mut input = PairingReader::default();
        input.push(b"pingping\n");
        assert_eq!(input.len(), 0);

        input.push(b"pi");
        assert!(!input.has_name());
        input.push(b"ng1|0|1.2.3.4|5|6.7.8.9|10|Bob");
        assert!(input.has_name());
        assert_eq!(&input.take_rest()[..], b"1|0|1.2.3.4|5|6.7.8.9|10|Bob");
    }

    #[test]
    fn test_reader_joins_split_line() {
        let mut input = PairingReader::default();
        input.push(b"0|1|10.0.0.1|4");
        assert!(!input.has_name());
        assert!(input.take_line().is_none());

        input.push(b"0001|192.168.0.2|51000|Sleeping\nping");
        let line = input.take_line().unwrap();
        assert_eq!(&line[..], b"0|1|10.0.0.1|40001|192.168.0.2|51000|Sleeping");
        assert_eq!(input.len(), 0);
    }

    #[test]
    fn test_pairing_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(b"ping1|0|203.0.113.7|").unwrap();
            thread::sleep(Duration::from_millis(150));
            stream.write_all(b"40001|192.168.0.12|51000|Lim").unwrap();
            thread::sleep(Duration::from_millis(10));
            stream.write_all(b"ace").unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let mut client = RendezvousClient::open(
            server_addr,
            "127.0.0.1".parse().unwrap(),
            Duration::from_millis(100),
        )
        .unwrap();
        let ticket = client.ticket("Escargot");
        let pairing = client.connect(&ticket, &AtomicBool::new(true)).unwrap();

        assert!(pairing.is_host);
        assert_eq!(pairing.peer_public, "203.0.113.7:40001".parse::<SocketAddr>().unwrap());
        assert_eq!(pairing.peer_name, "Limace");
        server.join().unwrap();
    }

    #[test]
    fn test_cancel_before_pairing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let len = stream.read(&mut buf).unwrap();
            let ticket = String::from_utf8_lossy(&buf[..len]).into_owned();
            stream.write_all(KEEPALIVE).unwrap();

            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            (ticket, rest)
        });

        let mut client = RendezvousClient::open(
            server_addr,
            "127.0.0.1".parse().unwrap(),
            Duration::from_millis(100),
        )
        .unwrap();
        let ticket = client.ticket("Escargot");
        let running = Arc::new(AtomicBool::new(true));

        let stopper = running.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stopper.store(false, Ordering::SeqCst);
        });

        let result = client.connect(&ticket, &running);
        assert!(matches!(result, Err(NetError::Cancelled)));

        let (ticket_line, rest) = server.join().unwrap();
        assert!(ticket_line.starts_with("127.0.0.1|"));
        assert!(ticket_line.ends_with("|Escargot"));
        assert_eq!(rest, CANCEL);
    }

    #[test]
    fn test_server_closing_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf);
        });

        let mut client = RendezvousClient::open(
            server_addr,
            "127.0.0.1".parse().unwrap(),
            Duration::from_millis(100),
        )
        .unwrap();
        let ticket = client.ticket("Escargot");
        let running = AtomicBool::new(true);
        assert!(matches!(
            client.connect(&ticket, &running),
            Err(NetError::ConnectionLost)
        ));
    }
}
