// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types, one enum per concern, unified under [`AuctionError`].

use crate::session::SessionState;
use thiserror::Error;

/// Result alias used by the runtimes.
pub type Result<T> = std::result::Result<T, AuctionError>;

/// Session protocol violations.
///
/// Everything here is logged and the offending message discarded, except
/// [`ProtocolError::HandshakeAckMismatch`] which tears the session down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected {flags} message in state {state:?}")]
    UnexpectedMessage { state: SessionState, flags: String },

    #[error("ack {0} does not match any pending message")]
    UnknownAck(u32),

    #[error("handshake aborted: ack {ack} does not match any pending message")]
    HandshakeAckMismatch { ack: u32 },

    #[error("session is not established (state {0:?})")]
    NotEstablished(SessionState),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("handshake timed out in state {0:?}")]
    HandshakeTimeout(SessionState),
}

impl ProtocolError {
    /// Whether the error terminates the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeAckMismatch { .. } | Self::HandshakeTimeout(_)
        )
    }
}

/// Registry lookups and mutations on absent, archived or duplicate keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already archived: {0}")]
    Archived(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("reference count of {0} is already zero")]
    ReferenceUnderflow(String),
}

/// Rejections that happen before anything is registered or mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("start, stop and duration cannot all be given")]
    IntervalOverSpecified,

    #[error("interval already expired: stop {stop} <= now {now}")]
    IntervalExpired { stop: u64, now: u64 },

    #[error("interval start {start} is after stop {stop}")]
    IntervalInverted { start: u64, stop: u64 },

    #[error("auction {auction} overlaps {existing} on resource {resource} ({kind})")]
    ReservationOverlap {
        resource: String,
        auction: String,
        existing: String,
        kind: &'static str,
    },

    #[error("{0} is not a bid")]
    NotABid(String),

    #[error("bid targets auction {bid_auction}, process serves {process_auction}")]
    AuctionMismatch {
        bid_auction: String,
        process_auction: String,
    },

    #[error("bid targets module {found}, process runs {expected}")]
    ModuleMismatch { expected: String, found: String },

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("{0}")]
    Invalid(String),
}

/// Allocation / bidding strategy failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module {0} is not loaded")]
    NotLoaded(String),

    #[error("module {module} rejected its configuration: {reason}")]
    InvalidConfig { module: String, reason: String },

    #[error("module {module} failed: {reason}")]
    Failed { module: String, reason: String },

    #[error("module {0} panicked during execution")]
    Panicked(String),

    #[error("module {module} cannot serve as {required} module")]
    WrongRole { module: String, required: &'static str },
}

/// Wire codec failures. Malformed input never panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("data set references unknown template {0}")]
    UnknownTemplate(u16),

    #[error("unknown template kind 0x{0:02x}")]
    UnknownTemplateKind(u8),

    #[error("unknown value type 0x{0:02x}")]
    UnknownValueType(u8),

    #[error("template id {0} is reserved")]
    ReservedTemplateId(u16),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("field {field} has type {found}, expected {expected}")]
    FieldTypeMismatch {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field {0} holds an invalid value")]
    InvalidValue(&'static str),

    #[error("record is missing field {0}")]
    MissingField(&'static str),

    #[error("message carries {found} records, expected {expected}")]
    UnexpectedKind { expected: &'static str, found: &'static str },

    #[error("value does not fit the wire format: {0}")]
    Overflow(&'static str),
}

/// Socket level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Top-level error for server and agent operations.
#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("already running")]
    AlreadyRunning,
}

impl From<std::io::Error> for AuctionError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_are_fatal() {
        assert!(ProtocolError::HandshakeAckMismatch { ack: 3 }.is_fatal());
        assert!(ProtocolError::HandshakeTimeout(SessionState::SynSent).is_fatal());
        assert!(!ProtocolError::UnknownAck(3).is_fatal());
        assert!(!ProtocolError::NotEstablished(SessionState::Closed).is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = ValidationError::ModuleMismatch {
            expected: "first_price".into(),
            found: "vickrey".into(),
        };
        assert!(err.to_string().contains("vickrey"));

        let err: AuctionError = RegistryError::Archived("auctions.a1".into()).into();
        assert!(err.to_string().contains("auctions.a1"));
    }
}
