// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Refcounted UDP connections shared by sessions to the same peer.
//!
//! Two pool modes exist:
//!
//! - **shared**: every connection sends through one bound listen socket
//!   (server side);
//! - **dedicated**: each distinct peer gets its own connected socket and a
//!   reader task (agent side).
//!
//! Inbound datagrams of either mode are forwarded into one channel. A
//! connection is torn down only when its reference count drops to zero.

use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A datagram received from `from`.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
}

/// Connection identity: peer address plus transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub peer: SocketAddr,
    pub protocol: Protocol,
}

impl ConnectionKey {
    pub fn udp(peer: SocketAddr) -> Self {
        Self {
            peer,
            protocol: Protocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Transport handle toward one peer.
pub struct Connection {
    key: ConnectionKey,
    socket: Arc<UdpSocket>,
    /// Socket is `connect`ed to the peer (dedicated mode).
    connected: bool,
    closed: AtomicBool,
    max_message_size: usize,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.key.peer
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Closed {
            return Err(TransportError::Closed(self.key.peer.to_string()));
        }
        if bytes.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        if self.connected {
            self.socket.send(bytes).await?;
        } else {
            self.socket.send_to(bytes, self.key.peer).await?;
        }
        trace!("Sent {} bytes to {}", bytes.len(), self.key.peer);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.key.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Forward datagrams from `socket` until the channel closes.
async fn read_loop(socket: Arc<UdpSocket>, max_message_size: usize, inbound: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; max_message_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let datagram = Datagram {
                    from,
                    bytes: buf[..len].to_vec(),
                };
                if inbound.send(datagram).await.is_err() {
                    break;
                }
            }
            // ICMP errors surface here on connected sockets; keep reading.
            Err(e) => debug!("Receive error: {}", e),
        }
    }
}

enum Mode {
    Shared(Arc<UdpSocket>),
    Dedicated { bind_ip: IpAddr },
}

struct Entry {
    conn: Arc<Connection>,
    refs: u32,
    reader: Option<JoinHandle<()>>,
}

pub struct ConnectionPool {
    mode: Mode,
    entries: Mutex<HashMap<ConnectionKey, Entry>>,
    inbound: mpsc::Sender<Datagram>,
    max_message_size: usize,
    shared_reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Bind the listen socket and start forwarding its datagrams.
    pub async fn shared(
        bind: SocketAddr,
        max_message_size: usize,
        inbound: mpsc::Sender<Datagram>,
    ) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        debug!("Listening on {}", socket.local_addr()?);
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), max_message_size, inbound.clone()));
        Ok(Self {
            mode: Mode::Shared(socket),
            entries: Mutex::new(HashMap::new()),
            inbound,
            max_message_size,
            shared_reader: Mutex::new(Some(reader)),
        })
    }

    /// A pool that binds one socket per peer on `bind_ip`.
    pub fn dedicated(bind_ip: IpAddr, max_message_size: usize, inbound: mpsc::Sender<Datagram>) -> Self {
        Self {
            mode: Mode::Dedicated { bind_ip },
            entries: Mutex::new(HashMap::new()),
            inbound,
            max_message_size,
            shared_reader: Mutex::new(None),
        }
    }

    /// Address of the listen socket (shared mode only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Shared(socket) => socket.local_addr().ok(),
            Mode::Dedicated { .. } => None,
        }
    }

    /// Take a reference on the connection to `peer`, creating it if needed.
    pub fn acquire(&self, peer: SocketAddr) -> Result<Arc<Connection>, TransportError> {
        let key = ConnectionKey::udp(peer);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.conn));
        }

        let (socket, connected, reader) = match &self.mode {
            Mode::Shared(socket) => (Arc::clone(socket), false, None),
            Mode::Dedicated { bind_ip } => {
                let std_socket = std::net::UdpSocket::bind(SocketAddr::new(*bind_ip, 0))?;
                std_socket.set_nonblocking(true)?;
                std_socket.connect(peer)?;
                let socket = Arc::new(UdpSocket::from_std(std_socket)?);
                let reader = tokio::spawn(read_loop(
                    Arc::clone(&socket),
                    self.max_message_size,
                    self.inbound.clone(),
                ));
                (socket, true, Some(reader))
            }
        };

        let conn = Arc::new(Connection {
            key,
            socket,
            connected,
            closed: AtomicBool::new(false),
            max_message_size: self.max_message_size,
        });
        debug!("Connection to {} opened", peer);
        entries.insert(
            key,
            Entry {
                conn: Arc::clone(&conn),
                refs: 1,
                reader,
            },
        );
        Ok(conn)
    }

    /// Drop a reference. Returns the remaining count; at zero the connection
    /// is closed and forgotten.
    pub fn release(&self, peer: SocketAddr) -> Result<u32, TransportError> {
        let key = ConnectionKey::udp(peer);
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| TransportError::Closed(peer.to_string()))?;
        entry.refs -= 1;
        let remaining = entry.refs;
        if remaining == 0 {
            if let Some(entry) = entries.remove(&key) {
                entry.conn.closed.store(true, Ordering::Release);
                if let Some(reader) = entry.reader {
                    reader.abort();
                }
                debug!("Connection to {} closed", peer);
            }
        }
        Ok(remaining)
    }

    pub fn get(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        self.entries
            .lock()
            .get(&ConnectionKey::udp(peer))
            .map(|e| Arc::clone(&e.conn))
    }

    pub fn refcount(&self, peer: SocketAddr) -> u32 {
        self.entries
            .lock()
            .get(&ConnectionKey::udp(peer))
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every reader task and close all connections.
    pub fn shutdown(&self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.conn.closed.store(true, Ordering::Release);
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
        if let Some(reader) = self.shared_reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.len())
            .field("local", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn closes_only_after_last_release() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = ConnectionPool::shared("127.0.0.1:0".parse().unwrap(), 1500, tx)
            .await
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:45000".parse().unwrap();

        let c1 = pool.acquire(peer).unwrap();
        let c2 = pool.acquire(peer).unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(pool.refcount(peer), 2);

        assert_eq!(pool.release(peer).unwrap(), 1);
        assert_eq!(c1.state(), ConnectionState::Open);
        assert!(pool.get(peer).is_some());

        assert_eq!(pool.release(peer).unwrap(), 0);
        assert_eq!(c1.state(), ConnectionState::Closed);
        assert!(pool.is_empty());
        assert!(pool.release(peer).is_err());
        assert!(matches!(c1.send(b"x").await, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn dedicated_sockets_deliver_into_the_shared_channel() {
        let (server_tx, mut server_rx) = mpsc::channel(8);
        let server = ConnectionPool::shared("127.0.0.1:0".parse().unwrap(), 1500, server_tx)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let (agent_tx, mut agent_rx) = mpsc::channel(8);
        let agent = ConnectionPool::dedicated("127.0.0.1".parse().unwrap(), 1500, agent_tx);
        let conn = agent.acquire(server_addr).unwrap();
        conn.send(b"ping").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.bytes, b"ping");
        assert_eq!(got.from, conn.local_addr().unwrap());

        let back = server.acquire(got.from).unwrap();
        back.send(b"pong").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), agent_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.bytes, b"pong");
        assert_eq!(got.from, server_addr);
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = ConnectionPool::dedicated("127.0.0.1".parse().unwrap(), 16, tx);
        let conn = pool.acquire("127.0.0.1:45001".parse().unwrap()).unwrap();
        assert!(matches!(
            conn.send(&[0u8; 17]).await,
            Err(TransportError::MessageTooLarge { size: 17, max: 16 })
        ));
    }
}
