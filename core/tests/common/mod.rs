//! Test fixtures: a fault-injecting UDP relay between two channels and a
//! minimal introduction server.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use snaildash_net::protocol::{PairingResult, KEEPALIVE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AtoB,
    BtoA,
}

/// What the relay does with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Duplicate,
    /// Hold until the next datagram in the same direction has gone through
    Delay,
}

/// Datagram seen by the relay and what happened to it
#[derive(Debug, Clone)]
pub struct Observed {
    pub direction: Direction,
    pub data: Vec<u8>,
    pub fate: Fate,
}

/// Sits between peer A and peer B. A talks to `a_side`, B talks to `b_side`.
pub struct Relay {
    pub a_side: SocketAddr,
    pub b_side: SocketAddr,
    log: Arc<Mutex<Vec<Observed>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn start<F>(a: SocketAddr, b: SocketAddr, mut policy: F) -> Relay
    where
        F: FnMut(Direction, &[u8]) -> Fate + Send + 'static,
    {
        let ra = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rb = UdpSocket::bind("127.0.0.1:0").unwrap();
        ra.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
        rb.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
        let a_side = ra.local_addr().unwrap();
        let b_side = rb.local_addr().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let log = log.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut held: Vec<(Direction, Vec<u8>)> = Vec::new();
                let mut buf = [0u8; 4096];

                let forward = |direction: Direction, data: &[u8]| match direction {
                    Direction::AtoB => {
                        let _ = rb.send_to(data, b);
                    }
                    Direction::BtoA => {
                        let _ = ra.send_to(data, a);
                    }
                };

                while !stop.load(Ordering::SeqCst) {
                    let mut arrived = Vec::new();
                    if let Ok((len, from)) = ra.recv_from(&mut buf) {
                        if from == a {
                            arrived.push((Direction::AtoB, buf[..len].to_vec()));
                        }
                    }
                    if let Ok((len, from)) = rb.recv_from(&mut buf) {
                        if from == b {
                            arrived.push((Direction::BtoA, buf[..len].to_vec()));
                        }
                    }

                    if arrived.is_empty() {
                        for (direction, data) in held.drain(..) {
                            forward(direction, &data);
                        }
                        continue;
                    }

                    for (direction, data) in arrived {
                        let fate = policy(direction, &data);
                        log.lock().unwrap().push(Observed {
                            direction,
                            data: data.clone(),
                            fate,
                        });
                        match fate {
                            Fate::Drop => {}
                            Fate::Delay => held.push((direction, data)),
                            Fate::Deliver | Fate::Duplicate => {
                                forward(direction, &data);
                                if fate == Fate::Duplicate {
                                    forward(direction, &data);
                                }
                                let (late, keep): (Vec<_>, Vec<_>) =
                                    held.drain(..).partition(|(d, _)| *d == direction);
                                held = keep;
                                for (d, late) in late {
                                    forward(d, &late);
                                }
                            }
                        }
                    }
                }
            })
        };

        Relay {
            a_side,
            b_side,
            log,
            stop,
            handle: Some(handle),
        }
    }

    pub fn observed(&self) -> Vec<Observed> {
        self.log.lock().unwrap().clone()
    }

    /// Datagrams in `direction` starting with `prefix`, whatever their fate
    pub fn count(&self, direction: Direction, prefix: &[u8]) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.direction == direction && o.data.starts_with(prefix))
            .count()
    }

    /// Copies of matching datagrams that actually reached the other side
    pub fn delivered(&self, direction: Direction, prefix: &[u8]) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.direction == direction && o.data.starts_with(prefix))
            .map(|o| match o.fate {
                Fate::Drop => 0,
                Fate::Duplicate => 2,
                Fate::Deliver | Fate::Delay => 1,
            })
            .sum()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Free loopback UDP address
pub fn free_udp_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Introduction server pairing the first two clients that register.
/// The first one becomes the host.
pub fn spawn_rendezvous(is_lan: bool) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut clients = Vec::new();
        let mut tickets = Vec::new();
        for _ in 0..2 {
            let (mut stream, public) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let len = stream.read(&mut buf).unwrap();
            let ticket = String::from_utf8_lossy(&buf[..len]).into_owned();
            let fields: Vec<&str> = ticket.splitn(3, '|').collect();
            let private: SocketAddr = format!("{}:{}", fields[0], fields[1]).parse().unwrap();
            let name = fields[2].to_string();

            // keep the first client waiting for a while
            stream.write_all(KEEPALIVE).unwrap();
            thread::sleep(Duration::from_millis(50));

            tickets.push(ticket.clone());
            clients.push((stream, public, private, name));
        }

        let (mut host, host_public, host_private, host_name) = clients.remove(0);
        let (mut guest, guest_public, guest_private, guest_name) = clients.remove(0);

        let for_host = PairingResult {
            is_host: true,
            is_lan,
            peer_public: guest_public,
            peer_private: guest_private,
            peer_name: guest_name,
        };
        let for_guest = PairingResult {
            is_host: false,
            is_lan,
            peer_public: host_public,
            peer_private: host_private,
            peer_name: host_name,
        };
        host.write_all(&for_host.encode()).unwrap();
        guest.write_all(&for_guest.encode()).unwrap();
        tickets
    });

    (addr, handle)
}
