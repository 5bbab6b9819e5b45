//! Direct Channel
//!
//! Pass-through over a TCP stream for peers on the same LAN. The stream
//! already guarantees order and delivery, so bytes go out as given and every
//! read is handed to the handler as is.

use bytes::Bytes;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::events::MessageHandler;
use crate::config::NetConfig;
use crate::error::{is_timeout, NetError, Result};

pub struct DirectChannel {
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
    running: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DirectChannel {
    pub fn start(
        stream: TcpStream,
        config: &NetConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.recv_timeout()))?;
        let reader = stream.try_clone()?;

        let running = Arc::new(AtomicBool::new(true));
        let listener = {
            let running = running.clone();
            let buf_len = config.max_datagram;
            thread::spawn(move || listen(reader, peer, running, handler, buf_len))
        };

        tracing::info!("Direct channel to {} started", peer);
        Ok(DirectChannel {
            writer: Mutex::new(stream),
            peer,
            running,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Write the payload to the stream. No-op after [`quit`](Self::quit).
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            tracing::debug!("Channel closed, dropping {} byte message", payload.len());
            return Ok(());
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(payload) {
            tracing::error!("Send to {} failed: {}", self.peer, e);
            self.running.store(false, Ordering::SeqCst);
            let _ = writer.shutdown(Shutdown::Both);
            return Err(NetError::Io(e));
        }
        Ok(())
    }

    /// Close the stream and stop the listener. Idempotent.
    pub fn quit(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Direct channel to {} closed", self.peer);
            let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writer.shutdown(Shutdown::Both);
        }

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for DirectChannel {
    fn drop(&mut self) {
        self.quit();
    }
}

fn listen(
    mut stream: TcpStream,
    peer: SocketAddr,
    running: Arc<AtomicBool>,
    handler: Arc<dyn MessageHandler>,
    buf_len: usize,
) {
    tracing::debug!("Direct listener started for {}", peer);
    let mut buf = vec![0u8; buf_len];

    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                if running.swap(false, Ordering::SeqCst) {
                    tracing::warn!("Connection closed by {}", peer);
                    handler.on_disconnect(&NetError::ConnectionLost);
                }
                break;
            }
            Ok(len) => handler.on_receive(Bytes::copy_from_slice(&buf[..len])),
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => {
                if running.swap(false, Ordering::SeqCst) {
                    tracing::error!("Receive from {} failed: {}", peer, e);
                    handler.on_disconnect(&NetError::Io(e));
                }
                break;
            }
        }
    }
    tracing::debug!("Direct listener stopped for {}", peer);
}
