//! Reliable Channel
//!
//! Ordered, exactly-once delivery of game messages over a hole-punched UDP
//! socket. One listener thread feeds the [`ReceiveCursor`]; one resend thread
//! retransmits every unacknowledged frame on a fixed period. There is no
//! backoff and no retry limit while the channel is open.

use bytes::Bytes;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::cursor::ReceiveCursor;
use super::events::MessageHandler;
use super::frame::Frame;
use super::pending::{PendingTable, HANDSHAKE_ID};
use crate::config::NetConfig;
use crate::error::{is_timeout, NetError, Result};
use crate::protocol::Probe;

/// Largest payload a single IPv4 UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Receive buffer; any datagram fits so nothing is ever truncated
const RECV_BUF_LEN: usize = 65_535;

struct Shared {
    socket: UdpSocket,
    peer: SocketAddr,
    running: AtomicBool,
    pending: Mutex<PendingTable>,
    handler: Arc<dyn MessageHandler>,
    max_datagram: usize,
}

/// Reliable channel to a single peer address
pub struct ReliableChannel {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableChannel {
    /// Start the listener and resend threads on an already negotiated socket.
    ///
    /// `confirmation` is the hole punching reply that made us converge. It is
    /// tracked as pending message -1 so the peer keeps receiving it until it
    /// acknowledges, even if the negotiation's last datagram was lost.
    pub fn start(
        socket: UdpSocket,
        peer: SocketAddr,
        confirmation: Option<Probe>,
        config: &NetConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(config.recv_timeout()))?;
        let local = socket.local_addr()?;

        let mut pending = PendingTable::new();
        if let Some(probe) = confirmation {
            pending.record(HANDSHAKE_ID, Bytes::from_static(probe.encode()));
        }

        let shared = Arc::new(Shared {
            socket,
            peer,
            running: AtomicBool::new(true),
            pending: Mutex::new(pending),
            handler,
            max_datagram: config.max_datagram,
        });

        if let Some(probe) = confirmation {
            shared.transmit(probe.encode());
        }

        let listener = {
            let shared = shared.clone();
            thread::spawn(move || shared.listen())
        };
        let resender = {
            let shared = shared.clone();
            let interval = config.resend_interval();
            let step = config.recv_timeout();
            thread::spawn(move || shared.resend_loop(interval, step))
        };

        tracing::info!("Reliable channel to {} started on {}", peer, local);
        Ok(ReliableChannel {
            shared,
            threads: Mutex::new(vec![listener, resender]),
        })
    }

    /// Queue a message and transmit it once. Returns immediately; delivery
    /// is driven by the resend thread. No-op after [`quit`](Self::quit).
    ///
    /// Fails with [`NetError::MessageTooLarge`] when the frame cannot fit in
    /// one datagram.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let frame = {
            let mut pending = self.shared.pending();
            // checked under the lock so a concurrent quit() never sees a new entry
            if !self.shared.running.load(Ordering::SeqCst) {
                tracing::debug!("Channel closed, dropping {} byte message", payload.len());
                return Ok(());
            }

            let id = pending.peek_id();
            let frame = Frame::Msg {
                id,
                payload: Bytes::copy_from_slice(payload),
            }
            .to_bytes();
            if frame.len() > MAX_UDP_PAYLOAD {
                return Err(NetError::MessageTooLarge(frame.len()));
            }
            pending.alloc_id();
            pending.record(id, frame.clone());
            frame
        };

        if frame.len() > self.shared.max_datagram {
            tracing::warn!(
                "Frame of {} bytes exceeds the {} byte datagram budget and may be fragmented",
                frame.len(),
                self.shared.max_datagram
            );
        }
        self.shared.transmit(&frame);
        Ok(())
    }

    /// Stop both threads. Idempotent; no frame is sent afterwards.
    pub fn quit(&self) {
        let was_running = {
            let _pending = self.shared.pending();
            self.shared.running.swap(false, Ordering::SeqCst)
        };
        if was_running {
            tracing::info!("Reliable channel to {} closed", self.shared.peer);
        }

        let handles: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            // quit() may be called from the handler, i.e. on the listener thread
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Messages (and the handshake confirmation) still awaiting an ack
    pub fn unacknowledged(&self) -> usize {
        self.shared.pending().unacknowledged_count()
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.quit();
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transmit(&self, frame: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.socket.send_to(frame, self.peer) {
            tracing::warn!("Failed to send to {}: {}", self.peer, e);
        }
    }

    fn listen(&self) {
        tracing::debug!("Listener started for {}", self.peer);
        let mut cursor = ReceiveCursor::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from != self.peer {
                        tracing::debug!("Ignoring {} bytes from stranger {}", len, from);
                        continue;
                    }
                    self.handle_datagram(&buf[..len], &mut cursor);
                }
                Err(ref e) if is_timeout(e) => continue,
                // Windows reports ICMP port unreachable on unconnected sockets
                Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    tracing::debug!("Peer {} not reachable yet: {}", self.peer, e);
                }
                Err(e) => {
                    if self.running.swap(false, Ordering::SeqCst) {
                        tracing::error!("Receive from {} failed: {}", self.peer, e);
                        self.handler.on_disconnect(&NetError::Io(e));
                    }
                    break;
                }
            }
        }
        tracing::debug!("Listener stopped for {}", self.peer);
    }

    fn handle_datagram(&self, data: &[u8], cursor: &mut ReceiveCursor) {
        if let Some(probe) = Probe::parse(data) {
            // The peer is still confirming the hole punch
            if probe.reply {
                self.transmit(&Frame::Ack(HANDSHAKE_ID).to_bytes());
            }
            return;
        }

        let frame = match Frame::decode(Bytes::copy_from_slice(data)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Discarding datagram from {}: {}", self.peer, e);
                return;
            }
        };
        tracing::trace!("Received {:?} from {}", frame, self.peer);

        match frame {
            Frame::Msg { id, payload } => {
                let outcome = cursor.on_msg(id, payload);
                for reply in &outcome.replies {
                    self.transmit(&reply.to_bytes());
                }
                for payload in outcome.deliver {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.handler.on_receive(payload);
                }
            }
            Frame::Ack(id) => {
                self.pending().acknowledge(id);
            }
            Frame::Res(id) => {
                let frame = self.pending().frame_for(id);
                match frame {
                    Some(frame) => self.transmit(&frame),
                    None => tracing::debug!("Peer requested unknown or acked id {}", id),
                }
            }
        }
    }

    fn resend_loop(&self, interval: Duration, step: Duration) {
        let mut last = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(step.min(interval));
            if last.elapsed() < interval {
                continue;
            }
            last = Instant::now();
            let frames = self.pending().retransmit_candidates();
            for (id, frame) in frames {
                tracing::trace!("Retransmitting {} to {}", id, self.peer);
                self.transmit(&frame);
            }
        }
    }
}
