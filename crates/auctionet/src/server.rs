// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auctioning server.
//!
//! Owns resources and auctions, answers asks with the applicable auctions,
//! collects bids and runs each auction's allocation module at every tick.
//!
//! Per auction, all timers are owned by the auction key:
//!
//! ```text
//!   start ──▶ activate: load module, create process, arm periodic tick
//!   tick  ──▶ execute window, send allocations to the bidders' sessions
//!   stop  ──▶ cancel ticks, execute what is left, release module, archive
//! ```

use crate::codec::{records, Message, MessageType};
use crate::config::NodeConfig;
use crate::context::Context;
use crate::definitions::{Definitions, LoadReport};
use crate::endpoint::{SessionEnd, SessionHandler, SessionLink};
use crate::error::{AuctionError, Result};
use crate::interval::now_ms;
use crate::module::ModuleLoader;
use crate::object::{Auction, BiddingObject, ObjectKey, ObjectKind, ObjectState, Resource};
use crate::processor::AuctionProcessor;
use crate::scheduler::TaskControl;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

struct ServerState {
    ctx: Context,
    processor: AuctionProcessor,
}

/// Auctioning server.
pub struct AuctionServer {
    state: Arc<ServerState>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl AuctionServer {
    pub fn new(ctx: Context) -> Self {
        Self {
            state: Arc::new(ServerState {
                ctx,
                processor: AuctionProcessor::new(),
            }),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind a server from its node configuration.
    pub async fn bind(config: NodeConfig, loader: ModuleLoader) -> Result<Self> {
        Ok(Self::new(Context::server(config, loader).await?))
    }

    pub fn context(&self) -> &Context {
        &self.state.ctx
    }

    pub fn processor(&self) -> &AuctionProcessor {
        &self.state.processor
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.ctx.endpoint().local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register every resource and auction of `defs`, resolving intervals
    /// against the current time.
    pub fn load_definitions(&self, defs: &Definitions) -> LoadReport {
        let now = now_ms();
        let mut report = LoadReport::default();

        let resources = defs.resources();
        report
            .rejected
            .extend(resources.rejected.iter().map(ToString::to_string));
        for resource in resources.objects {
            let key = resource.header.key.clone();
            match self.add_resource(resource) {
                Ok(()) => report.resources += 1,
                Err(e) => report.rejected.push(format!("{}: {}", key, e)),
            }
        }

        let auctions = defs.auctions(now);
        report
            .rejected
            .extend(auctions.rejected.iter().map(ToString::to_string));
        for auction in auctions.objects {
            let key = auction.key().clone();
            match self.add_auction(auction) {
                Ok(()) => report.auctions += 1,
                Err(e) => report.rejected.push(format!("{}: {}", key, e)),
            }
        }

        for rejected in &report.rejected {
            warn!("Definition rejected: {}", rejected);
        }
        info!(
            "Loaded {} resources and {} auctions ({} rejected)",
            report.resources,
            report.auctions,
            report.rejected.len()
        );
        report
    }

    pub fn add_resource(&self, resource: Resource) -> Result<()> {
        self.state.ctx.registry().insert(resource)?;
        Ok(())
    }

    /// Register an auction on its resource and schedule its lifetime.
    pub fn add_auction(&self, auction: Auction) -> Result<()> {
        self.state.ctx.loader().require_allocator(&auction.module)?;
        let key = auction.key().clone();
        let interval = auction.interval;
        {
            let mut registry = self.state.ctx.registry();
            registry.register_auction(auction)?;
            registry.set_state(ObjectKind::Auction, &key, ObjectState::Scheduled)?;
        }

        let scheduler = self.state.ctx.scheduler();
        let owner = key.to_string();
        let state = Arc::clone(&self.state);
        let activate_key = key.clone();
        scheduler.schedule_once(owner.clone(), interval.start, move || async move {
            state.activate(&activate_key).await;
        });

        if !interval.is_unbounded() {
            let state = Arc::clone(&self.state);
            scheduler.schedule_once(owner, interval.stop, move || async move {
                state.retire(&key, true).await;
            });
        }
        debug!("Auction scheduled over [{}, {})", interval.start, interval.stop);
        Ok(())
    }

    /// Remove an auction now: cancel its timers, drop its process and
    /// archive it. Pending windows are not executed.
    pub async fn remove_auction(&self, key: &ObjectKey) -> Result<()> {
        self.state.ctx.registry().auction(key)?;
        self.state.retire(key, false).await;
        Ok(())
    }

    /// Serve until [`AuctionServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AuctionError::AlreadyRunning);
        }
        info!(
            "Auction server '{}' listening on {:?}",
            self.state.ctx.config().name,
            self.local_addr()
        );
        let result = self
            .state
            .ctx
            .endpoint()
            .run(Arc::clone(&self.state), Arc::clone(&self.shutdown))
            .await;
        self.state.ctx.scheduler().shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Auction server stopped");
        result
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl ServerState {
    async fn activate(self: &Arc<Self>, key: &ObjectKey) {
        let auction = match self.ctx.registry().auction(key) {
            Ok(auction) => auction.clone(),
            Err(e) => {
                debug!("Auction {} not activated: {}", key, e);
                return;
            }
        };
        let handle = match self.ctx.loader().acquire(&auction.module) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Auction {} cannot load its module: {}", key, e);
                let _ = self.ctx.registry().set_state(ObjectKind::Auction, key, ObjectState::Error);
                return;
            }
        };
        if let Err((e, handle)) = self.processor.create(&auction, handle) {
            warn!("Auction {} not activated: {}", key, e);
            let _ = self.ctx.loader().release(handle);
            return;
        }
        let _ = self.ctx.registry().set_state(ObjectKind::Auction, key, ObjectState::Active);

        let interval = auction.interval;
        if interval.interval_ms == 0 {
            if interval.is_unbounded() {
                warn!("Auction {} has neither a stop time nor a period; it never executes", key);
            }
            info!("Auction {} active, single window at stop", key);
            return;
        }

        let (_, first_end) = interval.tick_window(interval.first_tick());
        let state = Arc::clone(self);
        let tick_key = key.clone();
        self.ctx.scheduler().schedule_periodic(
            key.to_string(),
            first_end,
            interval.interval_ms,
            move |_| {
                let state = Arc::clone(&state);
                let key = tick_key.clone();
                async move {
                    if state.tick(&key).await {
                        TaskControl::Stop
                    } else {
                        TaskControl::Continue
                    }
                }
            },
        );
        info!("Auction {} active, every {} ms", key, interval.interval_ms);
    }

    /// Execute the next window. Returns true once no window remains.
    async fn tick(&self, key: &ObjectKey) -> bool {
        let outcome = match self.processor.execute(key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Tick of {} skipped: {}", key, e);
                return true;
            }
        };
        if let Ok(allocations) = outcome.result {
            debug!(
                "Auction {} window [{}, {}) produced {} allocations",
                key,
                outcome.window.0,
                outcome.window.1,
                allocations.len()
            );
            self.distribute(allocations).await;
        }
        outcome.finished
    }

    /// Record allocations and send each to the session that placed the bid.
    async fn distribute(&self, allocations: Vec<BiddingObject>) {
        let mut by_session: BTreeMap<String, Vec<BiddingObject>> = BTreeMap::new();
        {
            let mut registry = self.ctx.registry();
            for allocation in allocations {
                registry.upsert_bidding_object(allocation.clone());
                match &allocation.session_id {
                    Some(id) => by_session.entry(id.clone()).or_default().push(allocation),
                    None => debug!("Allocation {} has no session", allocation.key()),
                }
            }
        }

        for (session_id, group) in by_session {
            let Some(link) = self.ctx.endpoint().link_by_id(&session_id) else {
                debug!("Session {} gone, {} allocations kept locally", session_id, group.len());
                continue;
            };
            if let Err(e) = link.send(records::allocations_message(&group)).await {
                warn!("Allocations to {} not sent: {}", session_id, e);
            }
        }
    }

    /// Tear an auction down. With `finish`, windows not yet executed run
    /// first.
    async fn retire(&self, key: &ObjectKey, finish: bool) {
        self.ctx.scheduler().cancel_owner(&key.to_string()).await;

        if finish && self.processor.contains(key) {
            while !self.tick(key).await {}
        }
        if let Some(process) = self.processor.remove(key).await {
            let handle = process.into_module();
            handle.module().reset();
            if let Err(e) = self.ctx.loader().release(handle) {
                warn!("Auction {} module release failed: {}", key, e);
            }
        }
        match self.ctx.registry().remove_auction(key) {
            Ok(()) => info!("Auction {} archived", key),
            Err(e) => debug!("Auction {} not archived: {}", key, e),
        }
    }

    /// Reference and bind every offered auction not yet bound to the
    /// session. Auctions that can no longer be referenced are dropped from
    /// `offered`.
    fn bind_offered(&self, link: &SessionLink, offered: &mut BTreeMap<ObjectKey, Auction>) -> Result<()> {
        let bound = self
            .ctx
            .sessions()
            .with_session(&link.key(), |s| s.auctions().to_vec())?;
        let mut taken = Vec::new();
        {
            let mut registry = self.ctx.registry();
            offered.retain(|key, _| {
                if bound.contains(key) {
                    return true;
                }
                match registry.add_auction_ref(key) {
                    Ok(_) => {
                        taken.push(key.clone());
                        true
                    }
                    Err(e) => {
                        debug!("Auction {} not offered to {}: {}", key, link.id(), e);
                        false
                    }
                }
            });
        }
        if let Err(e) = link.bind_auctions(&taken) {
            let mut registry = self.ctx.registry();
            for key in &taken {
                let _ = registry.release_auction_ref(key);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_ask(&self, link: &SessionLink, msg: &Message) -> Result<()> {
        let asks = records::parse_asks(msg)?;

        let mut offered: BTreeMap<ObjectKey, Auction> = BTreeMap::new();
        {
            let registry = self.ctx.registry();
            for ask in &asks {
                for auction in registry.applicable_auctions(&ask.resource, ask.start, ask.stop) {
                    offered.insert(auction.key().clone(), auction);
                }
            }
        }

        self.bind_offered(link, &mut offered)?;
        let auctions: Vec<Auction> = offered.into_values().collect();
        debug!(
            "Session {} asked {} windows, offered {} auctions",
            link.id(),
            asks.len(),
            auctions.len()
        );
        link.send(records::auctions_message(&auctions)).await
    }

    async fn on_bids(&self, link: &SessionLink, msg: &Message) -> Result<()> {
        let bids = records::parse_bids(msg)?;
        let session_id = link.id();
        let bound = self
            .ctx
            .sessions()
            .with_session(&link.key(), |s| s.auctions().to_vec())?;

        for mut bid in bids {
            if !bound.contains(&bid.auction) {
                warn!("Session {} bid on unoffered auction {}", session_id, bid.auction);
                continue;
            }
            // Allocations are routed back by the server-side session id.
            bid.session_id = Some(session_id.clone());
            let key = bid.key().clone();
            match self.processor.add_bid(bid.clone()).await {
                Ok(_) => {
                    self.ctx.registry().upsert_bidding_object(bid);
                    debug!("Bid {} accepted from {}", key, session_id);
                }
                Err(e) => warn!("Bid {} from {} rejected: {}", key, session_id, e),
            }
        }
        Ok(())
    }
}

impl SessionHandler for ServerState {
    async fn on_established(&self, link: SessionLink) {
        debug!("Agent session {} ready", link.id());
    }

    async fn on_message(&self, link: SessionLink, msg: Message) {
        let result = match msg.message_type() {
            MessageType::Ask => self.on_ask(&link, &msg).await,
            MessageType::Bid => self.on_bids(&link, &msg).await,
            other => {
                warn!("Session {} sent unexpected {:?} message", link.id(), other);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Session {}: {}", link.id(), e);
        }
    }

    async fn on_closed(&self, link: SessionLink, end: SessionEnd) {
        let session_id = link.id();
        {
            let mut registry = self.ctx.registry();
            for key in &end.auctions {
                if let Err(e) = registry.release_auction_ref(key) {
                    debug!("Session {} released {}: {}", session_id, key, e);
                }
            }
            registry.remove_bids_for_session(&session_id);
        }
        let dropped = self.processor.remove_bids_for_session(&session_id).await;
        info!(
            "Agent session {} ended ({:?}), {} bids withdrawn",
            session_id, end.reason, dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::interval::Interval;
    use crate::modules::first_price;
    use crate::object::ResourceSelector;
    use crate::session::SessionKey;

    async fn server() -> AuctionServer {
        let mut config = NodeConfig::default();
        config.server.bind_address = "127.0.0.1".into();
        config.server.port = 0;
        AuctionServer::bind(config, ModuleLoader::with_builtin()).await.unwrap()
    }

    fn auction(name: &str, start: u64, stop: u64) -> Auction {
        Auction::new(
            ObjectKey::new("auctions", name),
            ObjectKey::new("res", "bw"),
            first_price::NAME,
            Interval::new(start, stop, 100).unwrap(),
        )
    }

    #[tokio::test]
    async fn unknown_module_and_overlap_rejected() {
        let server = server().await;
        server.add_resource(Resource::new(ObjectKey::new("res", "bw"))).unwrap();
        let far = now_ms() + 60_000;

        let mut bad = auction("a0", far, far + 1_000);
        bad.module = "vickrey".into();
        assert!(matches!(
            server.add_auction(bad),
            Err(AuctionError::Module(ModuleError::UnknownModule(_)))
        ));

        let mut bidder = auction("a0", far, far + 1_000);
        bidder.module = crate::modules::fixed_bidder::NAME.into();
        assert!(matches!(
            server.add_auction(bidder),
            Err(AuctionError::Module(ModuleError::WrongRole { .. }))
        ));
        assert!(server.context().registry().live_keys(ObjectKind::Auction).is_empty());

        server.add_auction(auction("a1", far, far + 1_000)).unwrap();
        assert!(matches!(
            server.add_auction(auction("a2", far + 500, far + 2_000)),
            Err(AuctionError::Validation(_))
        ));
        assert_eq!(server.context().scheduler().tasks_for("auctions.a1").len(), 2);
        assert!(server.context().scheduler().tasks_for("auctions.a2").is_empty());
    }

    #[tokio::test]
    async fn ask_binds_only_auctions_it_could_reference() {
        let server = server().await;
        server.add_resource(Resource::new(ObjectKey::new("res", "bw"))).unwrap();
        let far = now_ms() + 60_000;
        let (a1, a2) = (ObjectKey::new("auctions", "a1"), ObjectKey::new("auctions", "a2"));
        server.add_auction(auction("a1", far, far + 1_000)).unwrap();
        server.add_auction(auction("a2", far + 1_000, far + 2_000)).unwrap();

        let mut offered: BTreeMap<ObjectKey, Auction> = server
            .context()
            .registry()
            .applicable_auctions(&ResourceSelector::Any, far, far + 2_000)
            .into_iter()
            .map(|a| (a.key().clone(), a))
            .collect();
        assert_eq!(offered.len(), 2);
        // a2 retires between the query and the reference.
        server.remove_auction(&a2).await.unwrap();

        let endpoint = server.context().endpoint();
        let key = SessionKey::new("127.0.0.1:40000".parse().unwrap(), 9);
        assert!(endpoint.sessions().accept(key, server.local_addr().unwrap(), 0));
        let link = endpoint.link(key);

        server.state.bind_offered(&link, &mut offered).unwrap();
        assert_eq!(offered.keys().cloned().collect::<Vec<_>>(), vec![a1.clone()]);
        assert_eq!(server.context().registry().auction(&a1).unwrap().session_refs, 1);
        let bound = endpoint
            .sessions()
            .with_session(&key, |s| s.auctions().to_vec())
            .unwrap();
        assert_eq!(bound, vec![a1.clone()]);

        // Asking again takes no second reference.
        server.state.bind_offered(&link, &mut offered).unwrap();
        assert_eq!(server.context().registry().auction(&a1).unwrap().session_refs, 1);

        let end = SessionEnd {
            reason: crate::endpoint::CloseReason::Aborted,
            auctions: endpoint.sessions().archive(&key).unwrap(),
        };
        server.state.on_closed(link, end).await;
        assert_eq!(server.context().registry().auction(&a1).unwrap().session_refs, 0);
    }

    #[tokio::test]
    async fn removal_cancels_timers_and_archives() {
        let server = server().await;
        server.add_resource(Resource::new(ObjectKey::new("res", "bw"))).unwrap();
        let far = now_ms() + 60_000;
        let key = ObjectKey::new("auctions", "a1");
        server.add_auction(auction("a1", far, far + 1_000)).unwrap();

        server.remove_auction(&key).await.unwrap();
        assert!(server.context().scheduler().tasks_for("auctions.a1").is_empty());
        assert!(server.context().registry().lookup(ObjectKind::Auction, &key).is_archived());
        assert!(matches!(
            server.remove_auction(&key).await,
            Err(AuctionError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn auction_lifecycle_loads_and_releases_module() {
        let server = server().await;
        server.add_resource(Resource::new(ObjectKey::new("res", "bw"))).unwrap();
        let now = now_ms();
        let key = ObjectKey::new("auctions", "a1");
        server.add_auction(auction("a1", now, now + 250)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(server.processor().contains(&key));
        assert_eq!(server.context().loader().refcount(first_price::NAME), 1);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(!server.processor().contains(&key));
        assert!(!server.context().loader().is_loaded(first_price::NAME));
        assert!(server.context().registry().lookup(ObjectKind::Auction, &key).is_archived());
        assert_eq!(server.context().scheduler().pending(), 0);
    }

    #[tokio::test]
    async fn load_report_lists_rejections() {
        let defs = Definitions::from_json_str(
            r#"{
                "resources": [{ "key": "res.bw" }, { "key": "res.bw" }],
                "auctions": [
                    { "key": "auctions.a1", "resource": "res.bw", "module": "first_price",
                      "start": 1, "stop": 2 },
                    { "key": "auctions.a2", "resource": "res.none", "module": "first_price",
                      "duration_ms": 60000 }
                ]
            }"#,
        )
        .unwrap();
        let server = server().await;
        let report = server.load_definitions(&defs);
        assert_eq!(report.resources, 1);
        assert_eq!(report.auctions, 0);
        assert_eq!(report.rejected.len(), 3);
        assert!(report.rejected.iter().any(|r| r.starts_with("auctions.a2")));
    }
}
