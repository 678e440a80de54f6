// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Live and archived session tables.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::state::{Session, SessionStep};
use super::{SessionKey, SessionState};
use crate::codec::Message;
use crate::error::ProtocolError;
use crate::interval::now_ms;
use crate::object::ObjectKey;

/// Archived sessions kept before the oldest are dropped.
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Tables {
    live: HashMap<SessionKey, Session>,
    archived: HashMap<SessionKey, Session>,
    archive_order: VecDeque<SessionKey>,
}

impl Tables {
    fn forget_archived(&mut self, key: &SessionKey) {
        if self.archived.remove(key).is_some() {
            self.archive_order.retain(|k| k != key);
        }
    }
}

/// Session registry shared by the dispatcher and the session workers.
///
/// The lock is never held across an `.await`. Archived sessions hold no
/// auction references, so past the archive capacity the oldest are dropped.
#[derive(Debug)]
pub struct SessionManager {
    tables: Mutex<Tables>,
    archive_capacity: usize,
    next_tag: AtomicU32,
    seq_seed: AtomicU32,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_archive_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    pub fn with_archive_capacity(archive_capacity: usize) -> Self {
        let seed = (now_ms() as u32).wrapping_mul(2_654_435_761);
        Self {
            tables: Mutex::new(Tables::default()),
            archive_capacity,
            next_tag: AtomicU32::new(seed | 1),
            seq_seed: AtomicU32::new(seed.rotate_left(16)),
        }
    }

    fn initial_seq(&self) -> u32 {
        self.seq_seed.fetch_add(0x0001_0000, Ordering::Relaxed)
    }

    /// Create an initiator session toward `peer` with a fresh tag.
    pub fn create_initiator(&self, peer: SocketAddr, local: SocketAddr, domain_id: u32) -> SessionKey {
        let mut tables = self.tables.lock();
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            let key = SessionKey::new(peer, tag);
            if tables.live.contains_key(&key) || tables.archived.contains_key(&key) {
                continue;
            }
            let session = Session::initiator(key, local, domain_id, self.initial_seq());
            tables.live.insert(key, session);
            return key;
        }
    }

    /// Create a listening responder for `key` unless one is already live.
    ///
    /// Returns true when a new session was created.
    pub fn accept(&self, key: SessionKey, local: SocketAddr, domain_id: u32) -> bool {
        let mut tables = self.tables.lock();
        if tables.live.contains_key(&key) {
            return false;
        }
        // A reused tag starts a new conversation.
        tables.forget_archived(&key);
        let session = Session::responder(key, local, domain_id, self.initial_seq());
        tables.live.insert(key, session);
        true
    }

    /// Run `f` on a live session.
    pub fn with_session<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, ProtocolError> {
        let mut tables = self.tables.lock();
        let session = tables
            .live
            .get_mut(key)
            .ok_or_else(|| ProtocolError::SessionNotFound(key.id()))?;
        Ok(f(session))
    }

    pub fn open(&self, key: &SessionKey) -> Result<Message, ProtocolError> {
        self.with_session(key, Session::open)?
    }

    pub fn handle(&self, key: &SessionKey, msg: Message) -> Result<SessionStep, ProtocolError> {
        self.with_session(key, |s| s.handle(msg))?
    }

    pub fn prepare(&self, key: &SessionKey, msg: Message) -> Result<Message, ProtocolError> {
        self.with_session(key, |s| s.prepare(msg))?
    }

    pub fn close(&self, key: &SessionKey) -> Result<Message, ProtocolError> {
        self.with_session(key, Session::close)?
    }

    pub fn abort(&self, key: &SessionKey) -> Result<(), ProtocolError> {
        self.with_session(key, Session::abort)
    }

    pub fn bind_auctions(&self, key: &SessionKey, auctions: &[ObjectKey]) -> Result<(), ProtocolError> {
        self.with_session(key, |s| {
            for a in auctions {
                s.bind_auction(a.clone());
            }
        })
    }

    /// Move a session to the archive, returning the auctions it was bound to.
    pub fn archive(&self, key: &SessionKey) -> Result<Vec<ObjectKey>, ProtocolError> {
        let mut tables = self.tables.lock();
        let mut session = tables
            .live
            .remove(key)
            .ok_or_else(|| ProtocolError::SessionNotFound(key.id()))?;
        let auctions = session.take_auctions();
        tables.forget_archived(key);
        tables.archived.insert(*key, session);
        tables.archive_order.push_back(*key);
        while tables.archived.len() > self.archive_capacity {
            let Some(oldest) = tables.archive_order.pop_front() else {
                break;
            };
            tables.archived.remove(&oldest);
        }
        Ok(auctions)
    }

    /// State of a live or archived session.
    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        let tables = self.tables.lock();
        tables
            .live
            .get(key)
            .or_else(|| tables.archived.get(key))
            .map(Session::state)
    }

    pub fn pending_count(&self, key: &SessionKey) -> Option<usize> {
        let tables = self.tables.lock();
        tables
            .live
            .get(key)
            .or_else(|| tables.archived.get(key))
            .map(Session::pending_count)
    }

    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.tables.lock().live.contains_key(key)
    }

    pub fn is_archived(&self, key: &SessionKey) -> bool {
        self.tables.lock().archived.contains_key(key)
    }

    /// Live session whose id string is `id`.
    pub fn find_by_id(&self, id: &str) -> Option<SessionKey> {
        self.tables.lock().live.keys().find(|k| k.id() == id).copied()
    }

    pub fn live_keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.tables.lock().live.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn live_len(&self) -> usize {
        self.tables.lock().live.len()
    }

    pub fn archived_len(&self) -> usize {
        self.tables.lock().archived.len()
    }
}
