// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequenced, acknowledged sessions on top of datagrams.
//!
//! ```text
//! initiator                                   responder
//! CLOSED                                      LISTEN
//!   ├── SYN(seq=s0) ───────────────────────────▶ │
//! SYN_SENT                                    SYN_RCVD
//!   │ ◀────────────────── SYN+ACK(seq=s1,ack=s0) ┤
//!   ├── ACK(seq=s2,ack=s1) ────────────────────▶ │
//! ESTABLISHED                                 ESTABLISHED
//!   ├── FIN(seq=f0) ───────────────────────────▶ │
//! FIN_WAIT_1                                  LAST_ACK
//!   │ ◀────────────────── ACK+FIN(seq=f1,ack=f0) ┤
//!   ├── ACK(ack=f1) ───────────────────────────▶ │
//! CLOSED                                      CLOSED
//! ```
//!
//! [`state::Session`] is the pure state machine; [`manager::SessionManager`]
//! holds live and archived sessions behind a lock.

pub mod manager;
pub mod state;


pub use manager::SessionManager;
pub use state::{PendingMessage, Session, SessionStep, Transition};

use std::fmt;
use std::net::SocketAddr;

/// Handshake and teardown states of both roles.
///
/// `Closed` doubles as the initiator's initial state and the final state of
/// either role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    LastAck,
}

impl SessionState {
    /// Opening handshake still in progress.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Listen | Self::SynSent | Self::SynRcvd)
    }

    /// Application messages are still exchanged in these states.
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Identity of a session: peer address plus the initiator's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub peer: SocketAddr,
    pub tag: u32,
}

impl SessionKey {
    pub fn new(peer: SocketAddr, tag: u32) -> Self {
        Self { peer, tag }
    }

    /// String form stamped on bids, `"{peer}#{tag}"`.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.tag)
    }
}
