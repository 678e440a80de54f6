// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auctioning agent.
//!
//! Every interval of a resource request gets its own session to the
//! server: opened at the interval start, closed at its stop. Over that
//! session the agent asks for auctions, bids through its module and
//! collects allocations.
//!
//! ```text
//!   interval start ──▶ open + SYN
//!   established    ──▶ ask
//!   auctions       ──▶ bind, run module, send bids (again every period)
//!   allocations    ──▶ record, publish
//!   interval stop  ──▶ FIN ... closed ──▶ release auction refs
//! ```

use crate::codec::{records, Message, MessageType};
use crate::config::NodeConfig;
use crate::context::Context;
use crate::definitions::{Definitions, LoadReport};
use crate::endpoint::{SessionEnd, SessionHandler, SessionLink};
use crate::error::{AuctionError, RegistryError, Result};
use crate::interval::now_ms;
use crate::module::ModuleLoader;
use crate::object::{
    Auction, BiddingObject, ObjectKey, ObjectKind, ObjectState, Resource, ResourceRequest,
};
use crate::processor::RequestProcess;
use crate::registry::Lookup;
use crate::scheduler::TaskControl;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

const ALLOCATION_CAPACITY: usize = 256;

/// One request interval bound to a session.
struct Slot {
    request: ObjectKey,
    index: usize,
    process: Option<Arc<RequestProcess>>,
}

struct AgentState {
    ctx: Context,
    server: SocketAddr,
    /// Request intervals in flight, by session id.
    slots: Mutex<HashMap<String, Slot>>,
    allocations: broadcast::Sender<BiddingObject>,
}

/// Auctioning agent.
pub struct AuctionAgent {
    state: Arc<AgentState>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl AuctionAgent {
    pub fn new(ctx: Context, server: SocketAddr) -> Self {
        let (allocations, _) = broadcast::channel(ALLOCATION_CAPACITY);
        Self {
            state: Arc::new(AgentState {
                ctx,
                server,
                slots: Mutex::new(HashMap::new()),
                allocations,
            }),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build an agent talking to the configured server.
    pub fn from_config(config: NodeConfig, loader: ModuleLoader) -> Result<Self> {
        let server = config.agent_server()?;
        Ok(Self::new(Context::agent(config, loader)?, server))
    }

    pub fn context(&self) -> &Context {
        &self.state.ctx
    }

    pub fn server(&self) -> SocketAddr {
        self.state.server
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Allocations as they arrive.
    pub fn subscribe_allocations(&self) -> broadcast::Receiver<BiddingObject> {
        self.state.allocations.subscribe()
    }

    /// Every live allocation received so far.
    pub fn allocations(&self) -> Vec<BiddingObject> {
        self.state.ctx.registry().bidding_objects(ObjectKind::Allocation)
    }

    /// Number of request intervals with a session in flight.
    pub fn active_intervals(&self) -> usize {
        self.state.slots.lock().len()
    }

    /// Register every request of `defs`, resolving intervals against the
    /// current time.
    pub fn load_definitions(&self, defs: &Definitions) -> LoadReport {
        let loaded = defs.requests(now_ms());
        let mut report = LoadReport {
            rejected: loaded.rejected.iter().map(ToString::to_string).collect(),
            ..LoadReport::default()
        };
        for request in loaded.objects {
            let key = request.key().clone();
            match self.add_request(request) {
                Ok(()) => report.requests += 1,
                Err(e) => report.rejected.push(format!("{}: {}", key, e)),
            }
        }
        for rejected in &report.rejected {
            warn!("Definition rejected: {}", rejected);
        }
        info!(
            "Loaded {} resource requests ({} rejected)",
            report.requests,
            report.rejected.len()
        );
        report
    }

    /// Register a request and schedule each of its intervals.
    pub fn add_request(&self, request: ResourceRequest) -> Result<()> {
        self.state.ctx.loader().require_bidder(&request.module)?;
        let key = request.key().clone();
        let intervals: Vec<_> = request.intervals.iter().map(|i| i.interval).collect();
        {
            let mut registry = self.state.ctx.registry();
            registry.insert(request)?;
            registry.set_state(ObjectKind::ResourceRequest, &key, ObjectState::Scheduled)?;
        }

        let scheduler = self.state.ctx.scheduler();
        let owner = key.to_string();
        for (index, interval) in intervals.into_iter().enumerate() {
            let state = Arc::clone(&self.state);
            let start_key = key.clone();
            scheduler.schedule_once(owner.clone(), interval.start, move || async move {
                state.start_interval(&start_key, index).await;
            });
            if !interval.is_unbounded() {
                let state = Arc::clone(&self.state);
                let stop_key = key.clone();
                scheduler.schedule_once(owner.clone(), interval.stop, move || async move {
                    state.stop_interval(&stop_key, index).await;
                });
            }
        }
        Ok(())
    }

    /// Cancel a request's timers, close its sessions and archive it.
    pub async fn remove_request(&self, key: &ObjectKey) -> Result<()> {
        self.state.ctx.registry().request(key)?;
        self.state.ctx.scheduler().cancel_owner(&key.to_string()).await;
        for link in self.state.links_of(key, None) {
            if let Err(e) = link.close().await {
                debug!("Session {} not closed: {}", link.id(), e);
            }
        }
        self.state.ctx.registry().remove(ObjectKind::ResourceRequest, key)?;
        Ok(())
    }

    /// Run until [`AuctionAgent::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AuctionError::AlreadyRunning);
        }
        info!(
            "Auction agent '{}' bidding at {}",
            self.state.ctx.config().name,
            self.state.server
        );
        let result = self
            .state
            .ctx
            .endpoint()
            .run(Arc::clone(&self.state), Arc::clone(&self.shutdown))
            .await;
        self.state.ctx.scheduler().shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Auction agent stopped");
        result
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl AgentState {
    /// Links of the sessions serving `request` (optionally one interval).
    fn links_of(&self, request: &ObjectKey, index: Option<usize>) -> Vec<SessionLink> {
        let ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, s)| &s.request == request && index.map_or(true, |i| s.index == i))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.ctx.endpoint().link_by_id(id))
            .collect()
    }

    async fn start_interval(&self, request: &ObjectKey, index: usize) {
        let link = match self.ctx.endpoint().open(self.server) {
            Ok(link) => link,
            Err(e) => {
                warn!("Request {} interval {}: no connection: {}", request, index, e);
                return;
            }
        };
        self.slots.lock().insert(
            link.id(),
            Slot {
                request: request.clone(),
                index,
                process: None,
            },
        );
        let _ = self
            .ctx
            .registry()
            .set_state(ObjectKind::ResourceRequest, request, ObjectState::Active);
        info!("Request {} interval {} opening session {}", request, index, link.id());
        if let Err(e) = link.connect().await {
            warn!("Session {} handshake not started: {}", link.id(), e);
        }
    }

    async fn stop_interval(&self, request: &ObjectKey, index: usize) {
        for link in self.links_of(request, Some(index)) {
            debug!("Request {} interval {} over, closing {}", request, index, link.id());
            if let Err(e) = link.close().await {
                debug!("Session {} not closed: {}", link.id(), e);
            }
        }
    }

    fn slot_of(&self, session_id: &str) -> Option<(ObjectKey, usize)> {
        self.slots
            .lock()
            .get(session_id)
            .map(|s| (s.request.clone(), s.index))
    }

    async fn send_ask(&self, link: &SessionLink) -> Result<()> {
        let Some((key, index)) = self.slot_of(&link.id()) else {
            return Ok(());
        };
        let ask = {
            let registry = self.ctx.registry();
            let request = registry.request(&key)?;
            let slot = request
                .intervals
                .get(index)
                .ok_or_else(|| RegistryError::NotFound(format!("{}[{}]", key, index)))?;
            records::Ask {
                request: key.clone(),
                resource: request.resource.clone(),
                start: slot.interval.start,
                stop: slot.interval.stop,
            }
        };
        link.send(records::ask_message(&[ask])).await
    }

    /// Take local references on offered auctions. Returns the keys taken.
    fn adopt_auctions(&self, auctions: &[Auction]) -> Vec<ObjectKey> {
        let mut registry = self.ctx.registry();
        let mut taken = Vec::new();
        for auction in auctions {
            let key = auction.key().clone();
            let live = match registry.lookup(ObjectKind::Auction, &key) {
                Lookup::Live(_) => true,
                Lookup::Archived(_) => {
                    debug!("Auction {} already retired locally", key);
                    false
                }
                Lookup::Missing => {
                    if !registry.contains(ObjectKind::Resource, &auction.resource) {
                        let _ = registry.insert(Resource::new(auction.resource.clone()));
                    }
                    match registry.register_auction(auction.clone()) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Auction {} not registered: {}", key, e);
                            false
                        }
                    }
                }
            };
            if live && registry.add_auction_ref(&key).is_ok() {
                taken.push(key);
            }
        }
        taken
    }

    async fn on_auctions(&self, link: &SessionLink, msg: &Message) -> Result<()> {
        let auctions = records::parse_auctions(msg)?;
        let session_id = link.id();
        let Some((key, index)) = self.slot_of(&session_id) else {
            return Ok(());
        };

        let taken = self.adopt_auctions(&auctions);
        link.bind_auctions(&taken)?;
        if auctions.is_empty() {
            info!("Session {}: no auction applies to {}", session_id, key);
            return Ok(());
        }

        let request = self.ctx.registry().request(&key)?.clone();
        let handle = self.ctx.loader().acquire(&request.module)?;
        let process = match RequestProcess::new(&request, index, handle, auctions, session_id.clone()) {
            Ok(process) => Arc::new(process),
            Err((e, handle)) => {
                let _ = self.ctx.loader().release(handle);
                return Err(e.into());
            }
        };
        if let Some(slot) = self.slots.lock().get_mut(&session_id) {
            slot.process = Some(Arc::clone(&process));
        }

        let interval = *process.interval();
        let first = interval.tick_window(interval.first_tick().max(now_ms().min(interval.stop)));
        bid_window(link, &process, first, &self.ctx).await;

        if interval.interval_ms > 0 && first.1 < interval.stop {
            let link = link.clone();
            let ctx = self.ctx.clone();
            self.ctx.scheduler().schedule_periodic(
                session_id,
                first.1,
                interval.interval_ms,
                move |fire_at| {
                    let link = link.clone();
                    let ctx = ctx.clone();
                    let process = Arc::clone(&process);
                    async move {
                        let window = process.interval().tick_window(fire_at);
                        bid_window(&link, &process, window, &ctx).await;
                        if window.1 >= process.interval().stop {
                            TaskControl::Stop
                        } else {
                            TaskControl::Continue
                        }
                    }
                },
            );
        }
        Ok(())
    }

    fn on_allocations(&self, link: &SessionLink, msg: &Message) -> Result<()> {
        let allocations = records::parse_allocations(msg)?;
        {
            let mut registry = self.ctx.registry();
            for allocation in &allocations {
                registry.upsert_bidding_object(allocation.clone());
            }
        }
        for allocation in allocations {
            info!(
                "Session {} won {} units on {} ({})",
                link.id(),
                allocation.total_quantity(),
                allocation.auction,
                allocation.key()
            );
            let _ = self.allocations.send(allocation);
        }
        Ok(())
    }
}

/// Run the bidding module over `window` and send the bids.
async fn bid_window(link: &SessionLink, process: &RequestProcess, window: (u64, u64), ctx: &Context) {
    let bids = match process.execute(window.0, window.1).await {
        Ok(bids) => bids,
        Err(e) => {
            warn!("Session {} bidding failed: {}", link.id(), e);
            return;
        }
    };
    if bids.is_empty() {
        return;
    }
    {
        let mut registry = ctx.registry();
        for bid in &bids {
            registry.upsert_bidding_object(bid.clone());
        }
    }
    debug!(
        "Session {} sends {} bids for [{}, {})",
        link.id(),
        bids.len(),
        window.0,
        window.1
    );
    if let Err(e) = link.send(records::bids_message(&bids)).await {
        warn!("Session {} bids not sent: {}", link.id(), e);
    }
}

impl SessionHandler for AgentState {
    async fn on_established(&self, link: SessionLink) {
        if let Err(e) = self.send_ask(&link).await {
            warn!("Session {} ask not sent: {}", link.id(), e);
        }
    }

    async fn on_message(&self, link: SessionLink, msg: Message) {
        let result = match msg.message_type() {
            MessageType::Auction => self.on_auctions(&link, &msg).await,
            MessageType::Allocation => self.on_allocations(&link, &msg),
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
        let slot = self.slots.lock().remove(&session_id);
        {
            let mut registry = self.ctx.registry();
            for key in &end.auctions {
                match registry.release_auction_ref(key) {
                    Ok(0) => {
                        if registry.remove_auction(key).is_ok() {
                            debug!("Auction {} retired locally", key);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Session {} released {}: {}", session_id, key, e),
                }
            }
            registry.remove_bids_for_session(&session_id);
        }

        if let Some(process) = slot.and_then(|s| s.process) {
            match Arc::try_unwrap(process) {
                Ok(process) => {
                    if let Err(e) = self.ctx.loader().release(process.into_module()) {
                        warn!("Session {} module release failed: {}", session_id, e);
                    }
                }
                Err(_) => warn!("Session {} request process still in use", session_id),
            }
        }
        info!("Session {} ended ({:?})", session_id, end.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::interval::Interval;
    use crate::modules::fixed_bidder;
    use crate::object::{RequestInterval, ResourceSelector};

    fn agent() -> AuctionAgent {
        let mut config = NodeConfig::default();
        config.agent.bind_address = "127.0.0.1".into();
        AuctionAgent::from_config(config, ModuleLoader::with_builtin()).unwrap()
    }

    fn request(name: &str, module: &str, start: u64) -> ResourceRequest {
        ResourceRequest::new(ObjectKey::new("requests", name), ResourceSelector::Any, module)
            .with_interval(RequestInterval::new(Interval::new(start, start + 1_000, 0).unwrap()))
            .with_interval(RequestInterval::new(Interval::new(start + 2_000, start + 3_000, 0).unwrap()))
    }

    #[tokio::test]
    async fn requests_schedule_both_ends_of_each_interval() {
        let agent = agent();
        let far = now_ms() + 60_000;
        agent.add_request(request("r1", fixed_bidder::NAME, far)).unwrap();
        assert_eq!(agent.context().scheduler().tasks_for("requests.r1").len(), 4);

        assert!(matches!(
            agent.add_request(request("r1", fixed_bidder::NAME, far)),
            Err(AuctionError::Registry(_))
        ));
        assert!(matches!(
            agent.add_request(request("r2", "nope", far)),
            Err(AuctionError::Module(ModuleError::UnknownModule(_)))
        ));
        assert!(matches!(
            agent.add_request(request("r3", crate::modules::first_price::NAME, far)),
            Err(AuctionError::Module(ModuleError::WrongRole { .. }))
        ));
        assert_eq!(agent.context().scheduler().tasks_for("requests.r3").len(), 0);

        agent.remove_request(&ObjectKey::new("requests", "r1")).await.unwrap();
        assert_eq!(agent.context().scheduler().pending(), 0);
    }

    #[tokio::test]
    async fn offered_auctions_are_adopted_once() {
        let agent = agent();
        let auction = Auction::new(
            ObjectKey::new("auctions", "a1"),
            ObjectKey::new("res", "bw"),
            "first_price",
            Interval::new(0, 100, 10).unwrap(),
        );

        let taken = agent.state.adopt_auctions(&[auction.clone()]);
        assert_eq!(taken, vec![auction.key().clone()]);
        agent.state.adopt_auctions(&[auction.clone()]);

        let mut registry = agent.context().registry();
        assert_eq!(registry.auction(auction.key()).unwrap().session_refs, 2);
        assert_eq!(registry.release_auction_ref(auction.key()).unwrap(), 1);
        assert!(registry.contains(ObjectKind::Resource, &auction.resource));
    }
}
