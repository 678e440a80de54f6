// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auctioning objects: resources, resource requests, auctions and bidding
//! objects.
//!
//! Every object carries an [`ObjectHeader`] (key + lifecycle state). The
//! registry stores them as the [`AuctioningObject`] sum type and dispatches
//! on the variant.

use crate::error::ValidationError;
use crate::interval::Interval;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wildcard resource selector accepted in asks.
pub const ANY_RESOURCE: &str = "any";

/// Unique object key, rendered as `"{set}.{name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    set: String,
    name: String,
}

impl ObjectKey {
    pub fn new(set: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            set: set.into(),
            name: name.into(),
        }
    }

    /// Parse `"{set}.{name}"`, splitting at the first dot.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.split_once('.') {
            Some((set, name)) if !set.is_empty() && !name.is_empty() => Ok(Self::new(set, name)),
            _ => Err(ValidationError::InvalidKey(s.to_string())),
        }
    }

    pub fn set(&self) -> &str {
        &self.set
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.set, self.name)
    }
}

/// Lifecycle state shared by all auctioning objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    New,
    Valid,
    Scheduled,
    Active,
    Done,
    Error,
}

/// Discriminant of an [`AuctioningObject`]; bidding objects split by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Resource,
    ResourceRequest,
    Auction,
    Bid,
    Allocation,
}

/// Key and state common to every object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub key: ObjectKey,
    pub state: ObjectState,
}

impl ObjectHeader {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            state: ObjectState::New,
        }
    }
}

/// Resource selector of an ask: a concrete resource or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSelector {
    Any,
    Key(ObjectKey),
}

impl ResourceSelector {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s == ANY_RESOURCE {
            Ok(Self::Any)
        } else {
            ObjectKey::parse(s).map(Self::Key)
        }
    }

    pub fn matches(&self, resource: &ObjectKey) -> bool {
        match self {
            Self::Any => true,
            Self::Key(key) => key == resource,
        }
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(ANY_RESOURCE),
            Self::Key(key) => key.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A resource sold through auctions; attached auctions may not overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub header: ObjectHeader,
    attached: Vec<(ObjectKey, Interval)>,
}

impl Resource {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            header: ObjectHeader::new(key),
            attached: Vec::new(),
        }
    }

    /// Attach an auction, rejecting any overlap with an attached one.
    pub fn attach(&mut self, auction: &ObjectKey, interval: &Interval) -> Result<(), ValidationError> {
        for (existing_key, existing) in &self.attached {
            if let Some(kind) = interval.overlap_with(existing) {
                return Err(ValidationError::ReservationOverlap {
                    resource: self.header.key.to_string(),
                    auction: auction.to_string(),
                    existing: existing_key.to_string(),
                    kind: kind.as_str(),
                });
            }
        }
        self.attached.push((auction.clone(), *interval));
        Ok(())
    }

    pub fn detach(&mut self, auction: &ObjectKey) -> bool {
        let before = self.attached.len();
        self.attached.retain(|(key, _)| key != auction);
        self.attached.len() != before
    }

    pub fn attached(&self) -> impl Iterator<Item = &ObjectKey> {
        self.attached.iter().map(|(key, _)| key)
    }
}

// ---------------------------------------------------------------------------
// Auction
// ---------------------------------------------------------------------------

/// An auction executing one allocation module over a resource's window.
#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    pub header: ObjectHeader,
    pub resource: ObjectKey,
    pub module: String,
    pub interval: Interval,
    /// Per-auction module parameters.
    pub params: BTreeMap<String, String>,
    /// Number of sessions currently bound to this auction.
    pub session_refs: u32,
}

impl Auction {
    pub fn new(key: ObjectKey, resource: ObjectKey, module: impl Into<String>, interval: Interval) -> Self {
        Self {
            header: ObjectHeader::new(key),
            resource,
            module: module.into(),
            interval,
            params: BTreeMap::new(),
            session_refs: 0,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> &ObjectKey {
        &self.header.key
    }
}

// ---------------------------------------------------------------------------
// Resource request
// ---------------------------------------------------------------------------

/// One scheduling window of a resource request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInterval {
    pub interval: Interval,
    /// Parameters handed to the bidding module (budget, quantity, ...).
    pub params: BTreeMap<String, String>,
}

impl RequestInterval {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// An agent's demand for a resource over one or more intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub header: ObjectHeader,
    pub resource: ResourceSelector,
    pub module: String,
    pub intervals: Vec<RequestInterval>,
}

impl ResourceRequest {
    pub fn new(key: ObjectKey, resource: ResourceSelector, module: impl Into<String>) -> Self {
        Self {
            header: ObjectHeader::new(key),
            resource,
            module: module.into(),
            intervals: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: RequestInterval) -> Self {
        self.intervals.push(interval);
        self
    }

    pub fn key(&self) -> &ObjectKey {
        &self.header.key
    }
}

// ---------------------------------------------------------------------------
// Bidding objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BiddingKind {
    Bid,
    Allocation,
}

/// One priced quantity inside a bid or allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BidElement {
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

impl BidElement {
    pub fn new(name: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_price,
        }
    }
}

/// A bid (agent to server) or an allocation (server to agent).
#[derive(Debug, Clone, PartialEq)]
pub struct BiddingObject {
    pub header: ObjectHeader,
    pub kind: BiddingKind,
    /// Parent auction.
    pub auction: ObjectKey,
    /// Module the bid was produced for.
    pub module: String,
    /// Session that owns the bid (stamped before transmission).
    pub session_id: Option<String>,
    pub elements: Vec<BidElement>,
    pub start: u64,
    pub stop: u64,
}

impl BiddingObject {
    pub fn bid(key: ObjectKey, auction: ObjectKey, module: impl Into<String>) -> Self {
        Self::with_kind(BiddingKind::Bid, key, auction, module)
    }

    pub fn allocation(key: ObjectKey, auction: ObjectKey, module: impl Into<String>) -> Self {
        Self::with_kind(BiddingKind::Allocation, key, auction, module)
    }

    fn with_kind(kind: BiddingKind, key: ObjectKey, auction: ObjectKey, module: impl Into<String>) -> Self {
        Self {
            header: ObjectHeader::new(key),
            kind,
            auction,
            module: module.into(),
            session_id: None,
            elements: Vec::new(),
            start: 0,
            stop: 0,
        }
    }

    pub fn with_element(mut self, element: BidElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_window(mut self, start: u64, stop: u64) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    pub fn key(&self) -> &ObjectKey {
        &self.header.key
    }

    pub fn object_kind(&self) -> ObjectKind {
        match self.kind {
            BiddingKind::Bid => ObjectKind::Bid,
            BiddingKind::Allocation => ObjectKind::Allocation,
        }
    }

    pub fn total_quantity(&self) -> f64 {
        self.elements.iter().map(|e| e.quantity).sum()
    }
}

// ---------------------------------------------------------------------------
// Sum type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AuctioningObject {
    Resource(Resource),
    ResourceRequest(ResourceRequest),
    Auction(Auction),
    BiddingObject(BiddingObject),
}

impl AuctioningObject {
    pub fn header(&self) -> &ObjectHeader {
        match self {
            Self::Resource(r) => &r.header,
            Self::ResourceRequest(r) => &r.header,
            Self::Auction(a) => &a.header,
            Self::BiddingObject(b) => &b.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ObjectHeader {
        match self {
            Self::Resource(r) => &mut r.header,
            Self::ResourceRequest(r) => &mut r.header,
            Self::Auction(a) => &mut a.header,
            Self::BiddingObject(b) => &mut b.header,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.header().key
    }

    pub fn state(&self) -> ObjectState {
        self.header().state
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Resource(_) => ObjectKind::Resource,
            Self::ResourceRequest(_) => ObjectKind::ResourceRequest,
            Self::Auction(_) => ObjectKind::Auction,
            Self::BiddingObject(b) => b.object_kind(),
        }
    }

    pub fn as_auction(&self) -> Option<&Auction> {
        match self {
            Self::Auction(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&ResourceRequest> {
        match self {
            Self::ResourceRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_bidding_object(&self) -> Option<&BiddingObject> {
        match self {
            Self::BiddingObject(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Resource> for AuctioningObject {
    fn from(r: Resource) -> Self {
        Self::Resource(r)
    }
}

impl From<ResourceRequest> for AuctioningObject {
    fn from(r: ResourceRequest) -> Self {
        Self::ResourceRequest(r)
    }
}

impl From<Auction> for AuctioningObject {
    fn from(a: Auction) -> Self {
        Self::Auction(a)
    }
}

impl From<BiddingObject> for AuctioningObject {
    fn from(b: BiddingObject) -> Self {
        Self::BiddingObject(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_display() {
        let key = ObjectKey::parse("auctions.bw.1").unwrap();
        assert_eq!(key.set(), "auctions");
        assert_eq!(key.name(), "bw.1");
        assert_eq!(key.to_string(), "auctions.bw.1");

        assert!(ObjectKey::parse("nodot").is_err());
        assert!(ObjectKey::parse(".name").is_err());
        assert!(ObjectKey::parse("set.").is_err());
    }

    #[test]
    fn selector_wildcard() {
        let r1 = ObjectKey::new("res", "r1");
        let r2 = ObjectKey::new("res", "r2");
        assert!(ResourceSelector::parse("any").unwrap().matches(&r2));
        let sel = ResourceSelector::parse("res.r1").unwrap();
        assert!(sel.matches(&r1));
        assert!(!sel.matches(&r2));
    }

    #[test]
    fn resource_rejects_overlapping_auctions() {
        let mut res = Resource::new(ObjectKey::new("res", "r1"));
        let a1 = ObjectKey::new("auctions", "a1");
        res.attach(&a1, &Interval::new(100, 200, 10).unwrap()).unwrap();

        for (start, stop) in [(120, 180), (50, 250), (150, 300)] {
            let err = res
                .attach(&ObjectKey::new("auctions", "a2"), &Interval::new(start, stop, 10).unwrap())
                .unwrap_err();
            assert!(matches!(err, ValidationError::ReservationOverlap { .. }));
        }
        assert_eq!(res.attached().count(), 1);

        res.attach(&ObjectKey::new("auctions", "a3"), &Interval::new(200, 300, 10).unwrap())
            .unwrap();
        assert_eq!(res.attached().count(), 2);
        assert!(res.detach(&a1));
        assert!(!res.detach(&a1));
    }

    #[test]
    fn sum_type_dispatch() {
        let bid = BiddingObject::bid(
            ObjectKey::new("bids", "b1"),
            ObjectKey::new("auctions", "a1"),
            "first_price",
        )
        .with_element(BidElement::new("e1", 2.0, 1.5))
        .with_element(BidElement::new("e2", 3.0, 1.0));
        assert_eq!(bid.total_quantity(), 5.0);

        let obj: AuctioningObject = bid.into();
        assert_eq!(obj.kind(), ObjectKind::Bid);
        assert_eq!(obj.state(), ObjectState::New);
        assert!(obj.as_auction().is_none());
        assert_eq!(obj.key().to_string(), "bids.b1");
    }
}
