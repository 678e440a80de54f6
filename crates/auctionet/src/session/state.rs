// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-session handshake / teardown state machine.
//
// No I/O happens here: every operation returns the messages to transmit and
// what the caller must do next. SYN, FIN and application messages are kept
// pending until the peer acknowledges them; bare ACKs never are.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use super::{Role, SessionKey, SessionState};
use crate::codec::{Flags, Message, MessageType, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::object::ObjectKey;

/// An outgoing message awaiting acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMessage {
    pub flags: Flags,
    pub message_type: MessageType,
}

/// State change reported to the owner of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Established,
    Closed,
}

/// Outcome of handling one inbound message.
#[derive(Debug, Default)]
pub struct SessionStep {
    /// Messages to transmit, in order.
    pub outgoing: Vec<Message>,
    /// Application message to hand to the session handler.
    pub delivered: Option<Message>,
    pub transition: Option<Transition>,
    /// Non-fatal protocol errors to log.
    pub warnings: Vec<ProtocolError>,
}

#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    local: SocketAddr,
    role: Role,
    state: SessionState,
    domain_id: u32,
    next_seq: u32,
    pending: BTreeMap<u32, PendingMessage>,
    /// Sequence number of our FIN while it is unacknowledged.
    fin_seq: Option<u32>,
    auctions: Vec<ObjectKey>,
}

impl Session {
    /// A session that will open the conversation (starts `Closed`).
    pub fn initiator(key: SessionKey, local: SocketAddr, domain_id: u32, initial_seq: u32) -> Self {
        Self::with_role(key, local, Role::Initiator, SessionState::Closed, domain_id, initial_seq)
    }

    /// A session waiting for the peer's SYN (starts `Listen`).
    pub fn responder(key: SessionKey, local: SocketAddr, domain_id: u32, initial_seq: u32) -> Self {
        Self::with_role(key, local, Role::Responder, SessionState::Listen, domain_id, initial_seq)
    }

    fn with_role(
        key: SessionKey,
        local: SocketAddr,
        role: Role,
        state: SessionState,
        domain_id: u32,
        initial_seq: u32,
    ) -> Self {
        Self {
            key,
            local,
            role,
            state,
            domain_id,
            next_seq: initial_seq,
            pending: BTreeMap::new(),
            fin_seq: None,
            auctions: Vec::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn id(&self) -> String {
        self.key.id()
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn peer(&self) -> SocketAddr {
        self.key.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, seq: u32) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Auctions this session is bound to.
    pub fn auctions(&self) -> &[ObjectKey] {
        &self.auctions
    }

    pub fn bind_auction(&mut self, key: ObjectKey) {
        if !self.auctions.contains(&key) {
            self.auctions.push(key);
        }
    }

    pub fn take_auctions(&mut self) -> Vec<ObjectKey> {
        std::mem::take(&mut self.auctions)
    }

    /// Allocate the next sequence number (wraps at 2^32).
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Confirm the pending message `ack`. Unknown acks change nothing.
    pub fn confirm_ack(&mut self, ack: u32) -> Result<PendingMessage, ProtocolError> {
        let confirmed = self.pending.remove(&ack).ok_or(ProtocolError::UnknownAck(ack))?;
        if self.fin_seq == Some(ack) {
            self.fin_seq = None;
        }
        Ok(confirmed)
    }

    /// Fill in the header of `msg` and record it pending unless it is a bare ACK.
    fn stamp(&mut self, mut msg: Message, flags: Flags, ack: Option<u32>) -> Message {
        let seq = self.next_seq();
        msg.header.version = PROTOCOL_VERSION;
        msg.header.domain_id = self.domain_id;
        msg.header.session_tag = self.key.tag;
        msg.header.flags = match ack {
            Some(_) => flags | Flags::ACK,
            None => flags,
        };
        msg.header.seq_no = seq;
        msg.header.ack_seq_no = ack.unwrap_or(0);

        let bare_ack = flags.is_empty() && ack.is_some() && !msg.is_application();
        if !bare_ack {
            self.pending.insert(
                seq,
                PendingMessage {
                    flags: msg.header.flags,
                    message_type: msg.message_type(),
                },
            );
        }
        msg
    }

    fn bare_ack(&mut self, ack: u32) -> Message {
        self.stamp(Message::default(), Flags::NONE, Some(ack))
    }

    fn unexpected(&self, msg: &Message) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            state: self.state,
            flags: msg.header.flags.to_string(),
        }
    }

    fn close_now(&mut self) {
        self.state = SessionState::Closed;
        self.pending.clear();
        self.fin_seq = None;
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Start the handshake: SYN, `Closed` to `SynSent`.
    pub fn open(&mut self) -> Result<Message, ProtocolError> {
        if self.role != Role::Initiator || self.state != SessionState::Closed {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state,
                flags: Flags::SYN.to_string(),
            });
        }
        let syn = self.stamp(Message::default(), Flags::SYN, None);
        self.state = SessionState::SynSent;
        Ok(syn)
    }

    /// Stamp an application message for transmission.
    pub fn prepare(&mut self, msg: Message) -> Result<Message, ProtocolError> {
        if !self.state.accepts_data() {
            return Err(ProtocolError::NotEstablished(self.state));
        }
        Ok(self.stamp(msg, Flags::NONE, None))
    }

    /// Start teardown: FIN, `Established` to `FinWait1`.
    pub fn close(&mut self) -> Result<Message, ProtocolError> {
        if self.state != SessionState::Established {
            return Err(ProtocolError::NotEstablished(self.state));
        }
        let fin = self.stamp(Message::default(), Flags::FIN, None);
        self.fin_seq = Some(fin.header.seq_no);
        self.state = SessionState::FinWait1;
        Ok(fin)
    }

    /// Tear down without a handshake.
    pub fn abort(&mut self) {
        self.close_now();
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Apply one inbound message.
    ///
    /// Errors leave the session unchanged. [`ProtocolError::is_fatal`]
    /// errors mean the caller must abort the session.
    pub fn handle(&mut self, msg: Message) -> Result<SessionStep, ProtocolError> {
        let mut step = SessionStep::default();
        let (syn, ack, fin) = (msg.syn(), msg.ack(), msg.fin());
        let seq = msg.seq_no();

        match self.state {
            SessionState::Listen => {
                if !syn || ack || fin {
                    return Err(self.unexpected(&msg));
                }
                let reply = self.stamp(Message::default(), Flags::SYN, Some(seq));
                step.outgoing.push(reply);
                self.state = SessionState::SynRcvd;
            }

            SessionState::SynSent => {
                if !(syn && ack) || fin {
                    return Err(self.unexpected(&msg));
                }
                let acked = msg.header.ack_seq_no;
                if self.confirm_ack(acked).is_err() {
                    return Err(ProtocolError::HandshakeAckMismatch { ack: acked });
                }
                step.outgoing.push(self.bare_ack(seq));
                self.state = SessionState::Established;
                step.transition = Some(Transition::Established);
            }

            SessionState::SynRcvd => {
                if !ack || syn || fin {
                    return Err(self.unexpected(&msg));
                }
                let acked = msg.header.ack_seq_no;
                if self.confirm_ack(acked).is_err() {
                    return Err(ProtocolError::HandshakeAckMismatch { ack: acked });
                }
                self.state = SessionState::Established;
                step.transition = Some(Transition::Established);
                if msg.is_application() {
                    step.outgoing.push(self.bare_ack(seq));
                    step.delivered = Some(msg);
                }
            }

            SessionState::Established => {
                if syn {
                    return Err(self.unexpected(&msg));
                }
                self.confirm_inbound_ack(&msg, &mut step);
                if fin {
                    // CLOSE_WAIT collapses into one ACK+FIN.
                    let reply = self.stamp(Message::default(), Flags::FIN, Some(seq));
                    self.fin_seq = Some(reply.header.seq_no);
                    step.outgoing.push(reply);
                    self.state = SessionState::LastAck;
                } else if msg.is_application() {
                    step.outgoing.push(self.bare_ack(seq));
                    step.delivered = Some(msg);
                }
            }

            SessionState::FinWait1 | SessionState::FinWait2 => {
                if syn {
                    return Err(self.unexpected(&msg));
                }
                let fin_acked = self.fin_seq.is_some_and(|f| ack && msg.header.ack_seq_no == f);
                self.confirm_inbound_ack(&msg, &mut step);
                if fin {
                    step.outgoing.push(self.bare_ack(seq));
                    self.close_now();
                    step.transition = Some(Transition::Closed);
                } else {
                    if fin_acked {
                        self.state = SessionState::FinWait2;
                    }
                    if msg.is_application() {
                        step.outgoing.push(self.bare_ack(seq));
                        step.delivered = Some(msg);
                    }
                }
            }

            SessionState::LastAck => {
                if !ack || syn || fin {
                    return Err(self.unexpected(&msg));
                }
                let fin_acked = self.fin_seq == Some(msg.header.ack_seq_no);
                self.confirm_inbound_ack(&msg, &mut step);
                if fin_acked {
                    self.close_now();
                    step.transition = Some(Transition::Closed);
                }
            }

            SessionState::Closed => return Err(self.unexpected(&msg)),
        }
        Ok(step)
    }

    fn confirm_inbound_ack(&mut self, msg: &Message, step: &mut SessionStep) {
        if let Some(acked) = msg.ack_seq_no() {
            if let Err(e) = self.confirm_ack(acked) {
                step.warnings.push(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::records;
    use crate::object::ResourceSelector;

    fn key() -> SessionKey {
        SessionKey::new("127.0.0.1:9000".parse().unwrap(), 7)
    }

    fn local() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    #[test]
    fn sequence_wraps() {
        let mut s = Session::initiator(key(), local(), 0, u32::MAX - 1);
        assert_eq!(s.next_seq(), u32::MAX - 1);
        assert_eq!(s.next_seq(), u32::MAX);
        assert_eq!(s.next_seq(), 0);
        assert_eq!(s.next_seq(), 1);
    }

    #[test]
    fn unknown_ack_leaves_state() {
        let mut s = Session::initiator(key(), local(), 0, 10);
        s.open().unwrap();
        assert_eq!(s.confirm_ack(99), Err(ProtocolError::UnknownAck(99)));
        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.state(), SessionState::SynSent);
        assert!(s.confirm_ack(10).is_ok());
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn handshake_ack_mismatch_is_fatal_and_mutates_nothing() {
        let mut s = Session::initiator(key(), local(), 0, 10);
        s.open().unwrap();
        let mut reply = Message::control(Flags::SYN | Flags::ACK);
        reply.header.seq_no = 500;
        reply.header.ack_seq_no = 11;
        let err = s.handle(reply).unwrap_err();
        assert_eq!(err, ProtocolError::HandshakeAckMismatch { ack: 11 });
        assert!(err.is_fatal());
        assert_eq!(s.state(), SessionState::SynSent);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn data_requires_established() {
        let mut s = Session::initiator(key(), local(), 0, 1);
        let ask = records::ask_message(&[records::Ask {
            request: ObjectKey::new("requests", "r1"),
            resource: ResourceSelector::Any,
            start: 0,
            stop: 10,
        }]);
        assert_eq!(
            s.prepare(ask).unwrap_err(),
            ProtocolError::NotEstablished(SessionState::Closed)
        );
        assert_eq!(s.close().unwrap_err(), ProtocolError::NotEstablished(SessionState::Closed));
    }

    #[test]
    fn unexpected_flags_discarded() {
        let mut s = Session::responder(key(), local(), 0, 1);
        let err = s.handle(Message::control(Flags::FIN)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { state: SessionState::Listen, .. }));
        assert!(!err.is_fatal());
        assert_eq!(s.state(), SessionState::Listen);
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn auction_binding_dedups() {
        let mut s = Session::responder(key(), local(), 0, 1);
        let a1 = ObjectKey::new("auctions", "a1");
        s.bind_auction(a1.clone());
        s.bind_auction(a1.clone());
        assert_eq!(s.auctions(), &[a1]);
        assert_eq!(s.take_auctions().len(), 1);
        assert!(s.auctions().is_empty());
    }
}
