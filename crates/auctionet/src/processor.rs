// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auction and request processes.
//!
//! An [`AuctionProcess`] binds one auction to one loaded module and the
//! auction's live bids. The [`AuctionProcessor`] keeps one async mutex per
//! process and holds it across the module call, which runs on the blocking
//! pool; bid insertion waits for an in-flight execution instead of
//! interleaving with it.
//!
//! A [`RequestProcess`] is the agent-side counterpart: it binds one
//! resource-request interval to a bidding module and the auctions offered
//! for it.

use crate::error::{AuctionError, ModuleError, RegistryError, ValidationError};
use crate::interval::Interval;
use crate::module::{ModuleConfig, ModuleHandle};
use crate::object::{Auction, BiddingObject, ObjectKey, ObjectKind, ResourceRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, warn};

fn join_failure(module: &str, e: JoinError) -> ModuleError {
    if e.is_panic() {
        ModuleError::Panicked(module.to_string())
    } else {
        ModuleError::Failed {
            module: module.to_string(),
            reason: "execution was cancelled".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auction process
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AuctionProcess {
    key: ObjectKey,
    interval: Interval,
    module: ModuleHandle,
    /// Module group merged with the auction's own parameters.
    config: ModuleConfig,
    bids: BTreeMap<ObjectKey, BiddingObject>,
    next_start: u64,
    executions: u64,
    failures: u64,
}

impl AuctionProcess {
    pub fn new(auction: &Auction, module: ModuleHandle) -> Self {
        let config = module.config().merged(&auction.params);
        Self {
            key: auction.key().clone(),
            interval: auction.interval,
            module,
            config,
            bids: BTreeMap::new(),
            next_start: auction.interval.first_tick(),
            executions: 0,
            failures: 0,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    pub fn bids(&self) -> impl Iterator<Item = &BiddingObject> {
        self.bids.values()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn next_start(&self) -> u64 {
        self.next_start
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Insert a bid, replacing one with the same key.
    ///
    /// Rejects anything that is not a bid for this auction and module; a
    /// rejected bid changes nothing.
    pub fn add_bid(&mut self, bid: BiddingObject) -> Result<Option<BiddingObject>, ValidationError> {
        if bid.object_kind() != ObjectKind::Bid {
            return Err(ValidationError::NotABid(bid.key().to_string()));
        }
        if bid.auction != self.key {
            return Err(ValidationError::AuctionMismatch {
                bid_auction: bid.auction.to_string(),
                process_auction: self.key.to_string(),
            });
        }
        if bid.module != self.module.name() {
            return Err(ValidationError::ModuleMismatch {
                expected: self.module.name().to_string(),
                found: bid.module.clone(),
            });
        }
        Ok(self.bids.insert(bid.key().clone(), bid))
    }

    pub fn remove_bid(&mut self, key: &ObjectKey) -> Option<BiddingObject> {
        self.bids.remove(key)
    }

    /// Drop every bid stamped with `session_id`. Returns how many went.
    pub fn remove_bids_for_session(&mut self, session_id: &str) -> usize {
        let before = self.bids.len();
        self.bids.retain(|_, b| b.session_id.as_deref() != Some(session_id));
        before - self.bids.len()
    }

    /// Window of the next execution, `None` once the stop time is reached.
    pub fn next_window(&self) -> Option<(u64, u64)> {
        if self.next_start >= self.interval.stop {
            return None;
        }
        Some(self.interval.tick_window(self.next_start))
    }

    pub fn is_finished(&self) -> bool {
        self.next_window().is_none()
    }

    /// Give back the module handle so the caller can release it.
    pub fn into_module(self) -> ModuleHandle {
        self.module
    }
}

/// Result of one auction tick.
#[derive(Debug)]
pub struct TickOutcome {
    pub window: (u64, u64),
    /// Allocations, or the module failure that marked this tick failed.
    pub result: Result<Vec<BiddingObject>, ModuleError>,
    /// No window remains after this one.
    pub finished: bool,
}

/// All auction processes of a server.
#[derive(Debug, Default)]
pub struct AuctionProcessor {
    processes: parking_lot::Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<AuctionProcess>>>>,
}

impl AuctionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn process(&self, key: &ObjectKey) -> Result<Arc<tokio::sync::Mutex<AuctionProcess>>, RegistryError> {
        self.processes
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Create the process of `auction` with an acquired module handle.
    ///
    /// On error the handle is returned so the caller can release it.
    pub fn create(&self, auction: &Auction, module: ModuleHandle) -> Result<(), (RegistryError, ModuleHandle)> {
        let mut processes = self.processes.lock();
        if processes.contains_key(auction.key()) {
            return Err((RegistryError::AlreadyExists(auction.key().to_string()), module));
        }
        let process = AuctionProcess::new(auction, module);
        debug!(
            "Auction process {} created (module {}, first window at {})",
            auction.key(),
            process.module_name(),
            process.next_start()
        );
        processes.insert(
            auction.key().clone(),
            Arc::new(tokio::sync::Mutex::new(process)),
        );
        Ok(())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.processes.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.processes.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Route a bid to its auction's process.
    pub async fn add_bid(&self, bid: BiddingObject) -> Result<Option<BiddingObject>, AuctionError> {
        let process = self.process(&bid.auction)?;
        let mut guard = process.lock().await;
        Ok(guard.add_bid(bid)?)
    }

    pub async fn remove_bids_for_session(&self, session_id: &str) -> usize {
        let processes: Vec<_> = self.processes.lock().values().cloned().collect();
        let mut removed = 0;
        for process in processes {
            removed += process.lock().await.remove_bids_for_session(session_id);
        }
        removed
    }

    pub async fn bid_count(&self, key: &ObjectKey) -> Result<usize, RegistryError> {
        Ok(self.process(key)?.lock().await.bid_count())
    }

    /// Execute the next window of `key`.
    ///
    /// The window advances even when the module fails, so the following
    /// tick still happens.
    pub async fn execute(&self, key: &ObjectKey) -> Result<TickOutcome, RegistryError> {
        let process = self.process(key)?;
        let mut guard = process.lock().await;

        let Some((start, end)) = guard.next_window() else {
            return Ok(TickOutcome {
                window: (guard.next_start, guard.next_start),
                result: Ok(Vec::new()),
                finished: true,
            });
        };

        let module = Arc::clone(guard.module.module());
        let module_name = guard.module_name().to_string();
        let config = guard.config.clone();
        let bids: Vec<BiddingObject> = guard.bids.values().cloned().collect();
        let auction = key.clone();

        let result = tokio::task::spawn_blocking(move || {
            module.execute(&config, &auction, start, end, &bids)
        })
        .await
        .unwrap_or_else(|e| Err(join_failure(&module_name, e)));

        guard.executions += 1;
        if let Err(e) = &result {
            guard.failures += 1;
            warn!("Auction {} window [{}, {}) failed: {}", key, start, end, e);
        }
        guard.next_start = end;

        Ok(TickOutcome {
            window: (start, end),
            result,
            finished: guard.is_finished(),
        })
    }

    /// Remove a process, waiting for an in-flight execution to finish.
    pub async fn remove(&self, key: &ObjectKey) -> Option<AuctionProcess> {
        let process = self.processes.lock().remove(key)?;
        // Wait for the current holder before taking the process apart.
        drop(process.lock().await);
        match Arc::try_unwrap(process) {
            Ok(mutex) => Some(mutex.into_inner()),
            Err(_) => {
                warn!("Auction process {} still referenced after removal", key);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request process (agent side)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RequestProcess {
    request: ObjectKey,
    index: usize,
    interval: Interval,
    params: BTreeMap<String, String>,
    module: ModuleHandle,
    auctions: Vec<Auction>,
    session_id: String,
}

impl RequestProcess {
    /// Bind interval `index` of `request` to the auctions offered over
    /// session `session_id`.
    ///
    /// On error the handle is returned so the caller can release it.
    pub fn new(
        request: &ResourceRequest,
        index: usize,
        module: ModuleHandle,
        auctions: Vec<Auction>,
        session_id: impl Into<String>,
    ) -> Result<Self, (ValidationError, ModuleHandle)> {
        let Some(slot) = request.intervals.get(index) else {
            let e = ValidationError::Invalid(format!("{} has no interval {}", request.key(), index));
            return Err((e, module));
        };
        Ok(Self {
            request: request.key().clone(),
            index,
            interval: slot.interval,
            params: slot.params.clone(),
            module,
            auctions,
            session_id: session_id.into(),
        })
    }

    pub fn request(&self) -> &ObjectKey {
        &self.request
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn auctions(&self) -> &[Auction] {
        &self.auctions
    }

    /// Run the bidding module over `[start, stop)` off the I/O path.
    ///
    /// Every bid comes back stamped with the owning session id, its name
    /// qualified by it so bids of different sessions never collide.
    pub async fn execute(&self, start: u64, stop: u64) -> Result<Vec<BiddingObject>, ModuleError> {
        let module = Arc::clone(self.module.module());
        let config = self.module.config().clone();
        let params = self.params.clone();
        let auctions = self.auctions.clone();

        let bids = tokio::task::spawn_blocking(move || {
            module.execute_for_agent(&config, &params, &auctions, start, stop)
        })
        .await
        .unwrap_or_else(|e| Err(join_failure(self.module.name(), e)))?;

        Ok(bids.into_iter().map(|bid| self.stamp(bid)).collect())
    }

    fn stamp(&self, mut bid: BiddingObject) -> BiddingObject {
        bid.header.key = ObjectKey::new(
            bid.key().set(),
            format!("{}@{}", bid.key().name(), self.session_id),
        );
        bid.session_id = Some(self.session_id.clone());
        bid
    }

    pub fn into_module(self) -> ModuleHandle {
        self.module
    }
}
