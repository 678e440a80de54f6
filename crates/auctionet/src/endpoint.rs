// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session endpoint: binds the session state machine to UDP transport.
//!
//! One dispatcher task decodes every inbound datagram and routes it by
//! `(peer, session tag)` to a per-session worker. Each worker applies
//! messages to its session strictly in arrival order, transmits the
//! replies and reports establishment, application messages and closure
//! to a [`SessionHandler`].
//!
//! ```text
//!  socket(s) ──▶ Datagram ──▶ dispatcher ──▶ worker(peer#tag) ──▶ handler
//!                                 ▲                │
//!  handshake timer ──▶ control ───┘                └──▶ transmit
//! ```

use crate::codec::{decode, encode, Message};
use crate::config::ProtocolConfig;
use crate::connection::{ConnectionPool, Datagram};
use crate::error::{AuctionError, ProtocolError, TransportError};
use crate::object::ObjectKey;
use crate::scheduler::Scheduler;
use crate::session::{SessionKey, SessionManager, SessionState, Transition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// FIN exchange completed.
    Graceful,
    /// Fatal protocol error.
    Aborted,
    /// Handshake did not complete in time.
    TimedOut,
}

/// What remains of a session once it is archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub reason: CloseReason,
    /// Auctions the session was bound to.
    pub auctions: Vec<ObjectKey>,
}

/// Callbacks driven by session workers.
///
/// Calls for one session never overlap and arrive in protocol order.
pub trait SessionHandler: Send + Sync + 'static {
    /// The handshake completed.
    fn on_established(&self, link: SessionLink) -> impl Future<Output = ()> + Send;

    /// An application message arrived (already acknowledged).
    ///
    /// # Arguments
    ///
    /// * `link` - Session the message arrived on
    /// * `msg` - Decoded message with its templates and records
    fn on_message(&self, link: SessionLink, msg: Message) -> impl Future<Output = ()> + Send;

    /// The session was closed and archived.
    fn on_closed(&self, link: SessionLink, end: SessionEnd) -> impl Future<Output = ()> + Send;
}

enum SessionEvent {
    Inbound(Message),
    HandshakeExpired,
}

enum Control {
    HandshakeExpired(SessionKey),
}

type Receivers = (mpsc::Receiver<Datagram>, mpsc::UnboundedReceiver<Control>);

struct Inner {
    sessions: Arc<SessionManager>,
    pool: ConnectionPool,
    scheduler: Scheduler,
    protocol: ProtocolConfig,
    domain_id: u32,
    /// Respond to unknown SYNs (server side).
    accept_incoming: bool,
    workers: Mutex<HashMap<SessionKey, mpsc::Sender<SessionEvent>>>,
    control: mpsc::UnboundedSender<Control>,
    receivers: Mutex<Option<Receivers>>,
}

/// Network side of a server or an agent. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

fn handshake_owner(key: &SessionKey) -> String {
    format!("{}/handshake", key.id())
}

impl Endpoint {
    fn build(
        pool: ConnectionPool,
        datagrams: mpsc::Receiver<Datagram>,
        scheduler: Scheduler,
        protocol: ProtocolConfig,
        domain_id: u32,
        accept_incoming: bool,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sessions: Arc::new(SessionManager::new()),
                pool,
                scheduler,
                protocol,
                domain_id,
                accept_incoming,
                workers: Mutex::new(HashMap::new()),
                control,
                receivers: Mutex::new(Some((datagrams, control_rx))),
            }),
        }
    }

    /// Endpoint listening on `bind` and accepting sessions (server side).
    pub async fn listen(
        bind: SocketAddr,
        domain_id: u32,
        protocol: ProtocolConfig,
        scheduler: Scheduler,
    ) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::channel(protocol.queue_depth);
        let pool = ConnectionPool::shared(bind, protocol.max_message_size, tx).await?;
        Ok(Self::build(pool, rx, scheduler, protocol, domain_id, true))
    }

    /// Endpoint that only opens sessions, one socket per server (agent side).
    pub fn connector(bind_ip: IpAddr, domain_id: u32, protocol: ProtocolConfig, scheduler: Scheduler) -> Self {
        let (tx, rx) = mpsc::channel(protocol.queue_depth);
        let pool = ConnectionPool::dedicated(bind_ip, protocol.max_message_size, tx);
        Self::build(pool, rx, scheduler, protocol, domain_id, false)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn domain_id(&self) -> u32 {
        self.inner.domain_id
    }

    /// Listen address (server side only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.pool.local_addr()
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Create an initiator session toward `peer`. Nothing is sent until
    /// [`SessionLink::connect`].
    pub fn open(&self, peer: SocketAddr) -> Result<SessionLink, TransportError> {
        let conn = self.inner.pool.acquire(peer)?;
        let local = match conn.local_addr() {
            Ok(local) => local,
            Err(e) => {
                let _ = self.inner.pool.release(peer);
                return Err(e);
            }
        };
        let key = self.inner.sessions.create_initiator(peer, local, self.inner.domain_id);
        debug!("Session {} created toward {}", key, peer);
        Ok(self.link(key))
    }

    pub fn link(&self, key: SessionKey) -> SessionLink {
        SessionLink {
            key,
            endpoint: self.clone(),
        }
    }

    /// Link to the live session whose id string is `id`.
    pub fn link_by_id(&self, id: &str) -> Option<SessionLink> {
        self.inner.sessions.find_by_id(id).map(|key| self.link(key))
    }

    fn arm_handshake_timeout(&self, key: SessionKey) {
        let control = self.inner.control.clone();
        self.inner.scheduler.schedule_after(
            handshake_owner(&key),
            self.inner.protocol.handshake_timeout(),
            move || async move {
                let _ = control.send(Control::HandshakeExpired(key));
            },
        );
    }

    async fn transmit(&self, key: &SessionKey, msg: &Message) -> Result<(), AuctionError> {
        let bytes = encode(msg)?;
        let conn = self
            .inner
            .pool
            .get(key.peer)
            .ok_or_else(|| TransportError::Closed(key.peer.to_string()))?;
        conn.send(&bytes).await?;
        trace!(
            "Session {} sent {} seq={} ({} bytes)",
            key,
            msg.header.flags,
            msg.header.seq_no,
            bytes.len()
        );
        Ok(())
    }

    /// Archive a closed session and release what it held.
    ///
    /// Session timers are cancelled and joined first, so a running body
    /// still sees its session live and its connection open.
    async fn finish(&self, key: &SessionKey) -> Vec<ObjectKey> {
        let scheduler = &self.inner.scheduler;
        scheduler.cancel_owner(&handshake_owner(key)).await;
        scheduler.cancel_owner(&key.id()).await;

        let auctions = self.inner.sessions.archive(key).unwrap_or_default();
        self.inner.workers.lock().remove(key);
        if let Err(e) = self.inner.pool.release(key.peer) {
            debug!("Session {} released no connection: {}", key, e);
        }
        auctions
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run the dispatcher until `shutdown` is notified.
    ///
    /// Returns [`AuctionError::AlreadyRunning`] if called twice.
    pub async fn run<H: SessionHandler>(&self, handler: Arc<H>, shutdown: Arc<Notify>) -> Result<(), AuctionError> {
        let (mut datagrams, mut control) = self
            .inner
            .receivers
            .lock()
            .take()
            .ok_or(AuctionError::AlreadyRunning)?;

        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Endpoint shutdown requested");
                    break;
                }
                datagram = datagrams.recv() => match datagram {
                    Some(d) => self.dispatch(d, &handler),
                    None => break,
                },
                Some(event) = control.recv() => match event {
                    Control::HandshakeExpired(key) => {
                        if self.inner.sessions.is_live(&key) {
                            self.deliver(key, SessionEvent::HandshakeExpired, &handler);
                        }
                    }
                },
            }
        }

        self.shutdown();
        Ok(())
    }

    fn dispatch<H: SessionHandler>(&self, datagram: Datagram, handler: &Arc<H>) {
        let msg = match decode(&datagram.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", datagram.from, e);
                return;
            }
        };
        if msg.header.domain_id != self.inner.domain_id {
            debug!(
                "Dropping message from {} for domain {}",
                datagram.from, msg.header.domain_id
            );
            return;
        }

        let key = SessionKey::new(datagram.from, msg.header.session_tag);
        if !self.inner.sessions.is_live(&key) {
            if !(self.inner.accept_incoming && msg.syn() && !msg.ack()) {
                debug!("No session {} for {} message", key, msg.header.flags);
                return;
            }
            if let Err(e) = self.accept(key) {
                warn!("Cannot accept session {}: {}", key, e);
                return;
            }
        }
        self.deliver(key, SessionEvent::Inbound(msg), handler);
    }

    fn accept(&self, key: SessionKey) -> Result<(), TransportError> {
        let local = self
            .inner
            .pool
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        if self.inner.sessions.accept(key, local, self.inner.domain_id) {
            if let Err(e) = self.inner.pool.acquire(key.peer) {
                let _ = self.inner.sessions.abort(&key);
                let _ = self.inner.sessions.archive(&key);
                return Err(e);
            }
            debug!("Session {} accepted", key);
            self.arm_handshake_timeout(key);
        }
        Ok(())
    }

    /// Queue an event on the session's worker, spawning it on first use.
    fn deliver<H: SessionHandler>(&self, key: SessionKey, event: SessionEvent, handler: &Arc<H>) {
        let tx = {
            let mut workers = self.inner.workers.lock();
            workers
                .entry(key)
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(self.inner.protocol.queue_depth);
                    tokio::spawn(session_worker(self.clone(), key, Arc::clone(handler), rx));
                    tx
                })
                .clone()
        };
        if tx.try_send(event).is_err() {
            warn!("Session {} queue full, message dropped", key);
        }
    }

    /// Drop every worker and close all connections.
    pub fn shutdown(&self) {
        self.inner.workers.lock().clear();
        self.inner.pool.shutdown();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("domain_id", &self.inner.domain_id)
            .field("sessions", &self.inner.sessions.live_len())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

async fn session_worker<H: SessionHandler>(
    endpoint: Endpoint,
    key: SessionKey,
    handler: Arc<H>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let sessions = Arc::clone(endpoint.sessions());
    let link = endpoint.link(key);

    while let Some(event) = events.recv().await {
        let msg = match event {
            SessionEvent::HandshakeExpired => {
                let Some(state) = sessions.state(&key).filter(|s| s.is_handshake()) else {
                    continue;
                };
                warn!("Session {}: {}", key, ProtocolError::HandshakeTimeout(state));
                let _ = sessions.abort(&key);
                let auctions = endpoint.finish(&key).await;
                handler
                    .on_closed(link.clone(), SessionEnd { reason: CloseReason::TimedOut, auctions })
                    .await;
                return;
            }
            SessionEvent::Inbound(msg) => msg,
        };

        trace!("Session {} received {} seq={}", key, msg.header.flags, msg.header.seq_no);
        let step = match sessions.handle(&key, msg) {
            Ok(step) => step,
            Err(e) if e.is_fatal() => {
                warn!("Session {} aborted: {}", key, e);
                let _ = sessions.abort(&key);
                let auctions = endpoint.finish(&key).await;
                handler
                    .on_closed(link.clone(), SessionEnd { reason: CloseReason::Aborted, auctions })
                    .await;
                return;
            }
            Err(e) => {
                warn!("Session {}: {}", key, e);
                continue;
            }
        };

        for w in &step.warnings {
            debug!("Session {}: {}", key, w);
        }
        for out in &step.outgoing {
            if let Err(e) = endpoint.transmit(&key, out).await {
                warn!("Session {} transmit failed: {}", key, e);
            }
        }

        if step.transition == Some(Transition::Established) {
            endpoint.scheduler().cancel_owner(&handshake_owner(&key)).await;
            info!("Session {} established", key);
            handler.on_established(link.clone()).await;
        }
        if let Some(msg) = step.delivered {
            handler.on_message(link.clone(), msg).await;
        }
        if step.transition == Some(Transition::Closed) {
            info!("Session {} closed", key);
            let auctions = endpoint.finish(&key).await;
            handler
                .on_closed(link.clone(), SessionEnd { reason: CloseReason::Graceful, auctions })
                .await;
            return;
        }
    }
}

/// Handle on one session, usable from handlers and timer bodies.
#[derive(Clone)]
pub struct SessionLink {
    key: SessionKey,
    endpoint: Endpoint,
}

impl SessionLink {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Stable `"peer#tag"` identifier.
    pub fn id(&self) -> String {
        self.key.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.key.peer
    }

    pub fn state(&self) -> Option<SessionState> {
        self.endpoint.sessions().state(&self.key)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send the SYN and arm the handshake timeout.
    pub async fn connect(&self) -> Result<(), AuctionError> {
        let syn = self.endpoint.sessions().open(&self.key)?;
        self.endpoint.arm_handshake_timeout(self.key);
        self.endpoint.transmit(&self.key, &syn).await
    }

    /// Send an application message.
    pub async fn send(&self, msg: Message) -> Result<(), AuctionError> {
        let msg = self.endpoint.sessions().prepare(&self.key, msg)?;
        self.endpoint.transmit(&self.key, &msg).await
    }

    /// Start the FIN exchange.
    pub async fn close(&self) -> Result<(), AuctionError> {
        let fin = self.endpoint.sessions().close(&self.key)?;
        self.endpoint.transmit(&self.key, &fin).await
    }

    /// Record auctions this session holds references on.
    pub fn bind_auctions(&self, auctions: &[ObjectKey]) -> Result<(), ProtocolError> {
        self.endpoint.sessions().bind_auctions(&self.key, auctions)
    }
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLink").field("key", &self.key).finish()
    }
}
