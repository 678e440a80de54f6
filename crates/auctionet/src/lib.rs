// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interval-scheduled resource auctions over a sequenced, acknowledged UDP
//! protocol.
//!
//! # Features
//!
//! - **Sessions**: three-way open and four-way close handshakes, per-message
//!   acknowledgment, several sessions multiplexed on one connection
//! - **Scheduling**: one-shot and periodic timers owned by auctions,
//!   requests and sessions, cancelled with cancel-then-join
//! - **Auction processing**: one allocation module per auction, executed
//!   off the I/O path at every window
//! - **Pluggable strategies**: modules resolved by name through
//!   [`ModuleLoader`]
//!
//! # Quick Start
//!
//! ```bash
//! auctionet gen-config -o node.toml
//! auctionet server --config node.toml --definitions auctions.json
//! auctionet agent --config node.toml --definitions requests.json
//! ```
//!
//! # Architecture
//!
//! ```text
//!   AuctionAgent                         AuctionServer
//!     RequestProcess                       AuctionProcessor
//!          │                                     │
//!     Endpoint ── Session(peer#tag) ══ UDP ══ Session ── Endpoint
//!          │                                     │
//!     Context: registry, loader, scheduler   Context
//! ```

pub mod agent;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod definitions;
pub mod endpoint;
pub mod error;
pub mod interval;
pub mod module;
pub mod modules;
pub mod object;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

pub use agent::AuctionAgent;
pub use codec::{decode, encode, Flags, Message, MessageHeader, MessageType};
pub use config::{ConfigError, NodeConfig, ProtocolConfig};
pub use context::Context;
pub use definitions::{Definitions, LoadReport};
pub use endpoint::{CloseReason, Endpoint, SessionEnd, SessionHandler, SessionLink};
pub use error::{
    AuctionError, CodecError, ModuleError, ProtocolError, RegistryError, Result, TransportError,
    ValidationError,
};
pub use interval::{Interval, IntervalSpec};
pub use module::{AllocationModule, ModuleConfig, ModuleHandle, ModuleLoader, ModuleRole};
pub use object::{
    Auction, AuctioningObject, BidElement, BiddingObject, ObjectKey, ObjectKind, ObjectState,
    Resource, ResourceRequest, ResourceSelector,
};
pub use processor::{AuctionProcess, AuctionProcessor, RequestProcess};
pub use registry::ObjectRegistry;
pub use scheduler::{Scheduler, TaskControl, TaskEvent, TaskId};
pub use server::AuctionServer;
pub use session::{SessionKey, SessionManager, SessionState};
