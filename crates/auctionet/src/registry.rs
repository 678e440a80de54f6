// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auctioning object registry.
//!
//! Objects live in one of two partitions. Removal moves an object from the
//! live partition to the archive (state `Done`); it never comes back. A
//! session winding down can still resolve an archived auction to drop its
//! reference.

use crate::error::{RegistryError, ValidationError};
use crate::object::{
    Auction, AuctioningObject, BiddingObject, ObjectKey, ObjectKind, ObjectState, ResourceRequest,
    ResourceSelector,
};
use std::collections::{HashMap, VecDeque};

type Slot = (ObjectKind, ObjectKey);

/// Archived objects kept before the oldest unreferenced ones are dropped.
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 4096;

/// Result of a lookup that distinguishes archived objects from missing ones.
#[derive(Debug)]
pub enum Lookup<'a> {
    Live(&'a AuctioningObject),
    Archived(&'a AuctioningObject),
    Missing,
}

impl Lookup<'_> {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    pub fn is_archived(&self) -> bool {
        matches!(self, Self::Archived(_))
    }
}

/// Keyed store for resources, requests, auctions and bidding objects.
///
/// The archive is bounded: past its capacity the oldest archived objects
/// are dropped, except auctions that sessions still reference.
#[derive(Debug)]
pub struct ObjectRegistry {
    live: HashMap<Slot, AuctioningObject>,
    archived: HashMap<Slot, AuctioningObject>,
    archive_order: VecDeque<Slot>,
    archive_capacity: usize,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::with_archive_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive_capacity(archive_capacity: usize) -> Self {
        Self {
            live: HashMap::new(),
            archived: HashMap::new(),
            archive_order: VecDeque::new(),
            archive_capacity,
        }
    }

    /// Register a new object. Fails if the key is already live.
    pub fn insert(&mut self, object: impl Into<AuctioningObject>) -> Result<(), RegistryError> {
        let object = object.into();
        let slot = (object.kind(), object.key().clone());
        if self.live.contains_key(&slot) {
            return Err(RegistryError::AlreadyExists(slot.1.to_string()));
        }
        self.live.insert(slot, object);
        Ok(())
    }

    pub fn lookup(&self, kind: ObjectKind, key: &ObjectKey) -> Lookup<'_> {
        let slot = (kind, key.clone());
        if let Some(obj) = self.live.get(&slot) {
            Lookup::Live(obj)
        } else if let Some(obj) = self.archived.get(&slot) {
            Lookup::Archived(obj)
        } else {
            Lookup::Missing
        }
    }

    /// Get a live object.
    pub fn get(&self, kind: ObjectKind, key: &ObjectKey) -> Result<&AuctioningObject, RegistryError> {
        match self.lookup(kind, key) {
            Lookup::Live(obj) => Ok(obj),
            Lookup::Archived(_) => Err(RegistryError::Archived(key.to_string())),
            Lookup::Missing => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    pub fn contains(&self, kind: ObjectKind, key: &ObjectKey) -> bool {
        self.live.contains_key(&(kind, key.clone()))
    }

    pub fn auction(&self, key: &ObjectKey) -> Result<&Auction, RegistryError> {
        self.get(ObjectKind::Auction, key)?
            .as_auction()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn request(&self, key: &ObjectKey) -> Result<&ResourceRequest, RegistryError> {
        self.get(ObjectKind::ResourceRequest, key)?
            .as_request()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Live bidding objects of one kind.
    pub fn bidding_objects(&self, kind: ObjectKind) -> Vec<BiddingObject> {
        let mut found: Vec<BiddingObject> = self
            .live
            .values()
            .filter_map(AuctioningObject::as_bidding_object)
            .filter(|b| b.object_kind() == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key().cmp(b.key()));
        found
    }

    /// Mutate a live object in place.
    pub fn update<R>(
        &mut self,
        kind: ObjectKind,
        key: &ObjectKey,
        f: impl FnOnce(&mut AuctioningObject) -> R,
    ) -> Result<R, RegistryError> {
        let slot = (kind, key.clone());
        match self.live.get_mut(&slot) {
            Some(obj) => Ok(f(obj)),
            None if self.archived.contains_key(&slot) => Err(RegistryError::Archived(key.to_string())),
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    pub fn set_state(&mut self, kind: ObjectKind, key: &ObjectKey, state: ObjectState) -> Result<(), RegistryError> {
        self.update(kind, key, |obj| obj.header_mut().state = state)
    }

    /// Move a live object to the archive.
    pub fn remove(&mut self, kind: ObjectKind, key: &ObjectKey) -> Result<(), RegistryError> {
        let slot = (kind, key.clone());
        match self.live.remove(&slot) {
            Some(mut obj) => {
                obj.header_mut().state = ObjectState::Done;
                if self.archived.insert(slot.clone(), obj).is_some() {
                    self.archive_order.retain(|s| *s != slot);
                }
                self.archive_order.push_back(slot);
                self.prune_archived();
                Ok(())
            }
            None if self.archived.contains_key(&slot) => Err(RegistryError::Archived(key.to_string())),
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    /// Drop the oldest archived objects beyond capacity. Referenced auctions
    /// stay until their last session lets go.
    fn prune_archived(&mut self) {
        let mut pinned = Vec::new();
        while self.archived.len() > self.archive_capacity {
            let Some(slot) = self.archive_order.pop_front() else {
                break;
            };
            let referenced = matches!(
                self.archived.get(&slot),
                Some(AuctioningObject::Auction(a)) if a.session_refs > 0
            );
            if referenced {
                pinned.push(slot);
            } else {
                self.archived.remove(&slot);
            }
        }
        for slot in pinned.into_iter().rev() {
            self.archive_order.push_front(slot);
        }
    }

    pub fn live_keys(&self, kind: ObjectKind) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .live
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn archived_len(&self) -> usize {
        self.archived.len()
    }

    // -----------------------------------------------------------------------
    // Auctions
    // -----------------------------------------------------------------------

    /// Register an auction and reserve its window on the resource.
    ///
    /// The resource must be live. Nothing is mutated when the key is taken
    /// or the window overlaps an auction already attached to the resource.
    pub fn register_auction(&mut self, auction: Auction) -> Result<(), RegistryRejection> {
        let key = auction.key().clone();
        if self.contains(ObjectKind::Auction, &key) {
            return Err(RegistryError::AlreadyExists(key.to_string()).into());
        }
        let interval = auction.interval;
        let resource_slot = (ObjectKind::Resource, auction.resource.clone());
        match self.live.get_mut(&resource_slot) {
            Some(AuctioningObject::Resource(resource)) => resource.attach(&key, &interval)?,
            _ => return Err(RegistryError::NotFound(auction.resource.to_string()).into()),
        }
        self.live.insert((ObjectKind::Auction, key), auction.into());
        Ok(())
    }

    /// Archive an auction and release its reservation on the resource.
    pub fn remove_auction(&mut self, key: &ObjectKey) -> Result<(), RegistryError> {
        let resource = self.auction(key)?.resource.clone();
        if let Some(AuctioningObject::Resource(res)) =
            self.live.get_mut(&(ObjectKind::Resource, resource))
        {
            res.detach(key);
        }
        self.remove(ObjectKind::Auction, key)
    }

    /// Bind one more session to a live auction. Returns the new count.
    pub fn add_auction_ref(&mut self, key: &ObjectKey) -> Result<u32, RegistryError> {
        self.update(ObjectKind::Auction, key, |obj| match obj {
            AuctioningObject::Auction(a) => {
                a.session_refs += 1;
                Some(a.session_refs)
            }
            _ => None,
        })?
        .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Drop a session reference from a live or archived auction.
    ///
    /// Returns the remaining count; the caller schedules removal at zero.
    pub fn release_auction_ref(&mut self, key: &ObjectKey) -> Result<u32, RegistryError> {
        let slot = (ObjectKind::Auction, key.clone());
        let obj = match self.live.get_mut(&slot) {
            Some(obj) => obj,
            None => self
                .archived
                .get_mut(&slot)
                .ok_or_else(|| RegistryError::NotFound(key.to_string()))?,
        };
        match obj {
            AuctioningObject::Auction(a) if a.session_refs == 0 => {
                Err(RegistryError::ReferenceUnderflow(key.to_string()))
            }
            AuctioningObject::Auction(a) => {
                a.session_refs -= 1;
                Ok(a.session_refs)
            }
            _ => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    /// Live auctions overlapping `[start, end)` on the selected resource.
    pub fn applicable_auctions(&self, selector: &ResourceSelector, start: u64, end: u64) -> Vec<Auction> {
        let mut found: Vec<Auction> = self
            .live
            .values()
            .filter_map(AuctioningObject::as_auction)
            .filter(|a| selector.matches(&a.resource))
            .filter(|a| a.interval.overlaps_window(start, end))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key().cmp(b.key()));
        found
    }

    // -----------------------------------------------------------------------
    // Bidding objects
    // -----------------------------------------------------------------------

    /// Insert or replace a live bidding object.
    pub fn upsert_bidding_object(&mut self, object: BiddingObject) {
        let slot = (object.object_kind(), object.key().clone());
        self.live.insert(slot, object.into());
    }

    /// Live bids belonging to one auction.
    pub fn bids_for_auction(&self, auction: &ObjectKey) -> Vec<BiddingObject> {
        self.live
            .values()
            .filter_map(AuctioningObject::as_bidding_object)
            .filter(|b| b.object_kind() == ObjectKind::Bid && &b.auction == auction)
            .cloned()
            .collect()
    }

    /// Archive every live bid stamped with `session_id`.
    pub fn remove_bids_for_session(&mut self, session_id: &str) -> Vec<ObjectKey> {
        let keys: Vec<ObjectKey> = self
            .live
            .values()
            .filter_map(AuctioningObject::as_bidding_object)
            .filter(|b| b.object_kind() == ObjectKind::Bid)
            .filter(|b| b.session_id.as_deref() == Some(session_id))
            .map(|b| b.key().clone())
            .collect();
        for key in &keys {
            let _ = self.remove(ObjectKind::Bid, key);
        }
        keys
    }
}

/// Rejection of [`ObjectRegistry::register_auction`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryRejection {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<RegistryRejection> for crate::error::AuctionError {
    fn from(e: RegistryRejection) -> Self {
        match e {
            RegistryRejection::Registry(e) => e.into(),
            RegistryRejection::Validation(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::object::{BidElement, Resource};

    fn key(set: &str, name: &str) -> ObjectKey {
        ObjectKey::new(set, name)
    }

    fn registry_with_resource() -> ObjectRegistry {
        let mut reg = ObjectRegistry::new();
        reg.insert(Resource::new(key("res", "r1"))).unwrap();
        reg
    }

    fn auction(name: &str, start: u64, stop: u64) -> Auction {
        Auction::new(
            key("auctions", name),
            key("res", "r1"),
            "first_price",
            Interval::new(start, stop, 5).unwrap(),
        )
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut reg = registry_with_resource();
        let err = reg.insert(Resource::new(key("res", "r1"))).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyExists("res.r1".into()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn removal_archives_once() {
        let mut reg = registry_with_resource();
        let k = key("res", "r1");
        reg.remove(ObjectKind::Resource, &k).unwrap();

        assert!(reg.lookup(ObjectKind::Resource, &k).is_archived());
        match reg.lookup(ObjectKind::Resource, &k) {
            Lookup::Archived(obj) => assert_eq!(obj.state(), ObjectState::Done),
            other => panic!("expected archived, got {:?}", other),
        }
        assert_eq!(
            reg.get(ObjectKind::Resource, &k).unwrap_err(),
            RegistryError::Archived("res.r1".into())
        );
        assert_eq!(
            reg.remove(ObjectKind::Resource, &k).unwrap_err(),
            RegistryError::Archived("res.r1".into())
        );
        assert!(matches!(
            reg.lookup(ObjectKind::Resource, &key("res", "nope")),
            Lookup::Missing
        ));
        assert_eq!(
            reg.get(ObjectKind::Resource, &key("res", "nope")).unwrap_err(),
            RegistryError::NotFound("res.nope".into())
        );
    }

    #[test]
    fn overlapping_auction_rejected_without_mutation() {
        let mut reg = registry_with_resource();
        reg.register_auction(auction("a1", 100, 200)).unwrap();

        let err = reg.register_auction(auction("a2", 150, 250)).unwrap_err();
        assert!(matches!(err, RegistryRejection::Validation(_)));
        assert!(!reg.contains(ObjectKind::Auction, &key("auctions", "a2")));

        reg.register_auction(auction("a2", 200, 300)).unwrap();
        assert_eq!(reg.live_keys(ObjectKind::Auction).len(), 2);
    }

    #[test]
    fn auction_requires_live_resource() {
        let mut reg = ObjectRegistry::new();
        let err = reg.register_auction(auction("a1", 0, 10)).unwrap_err();
        assert_eq!(
            err,
            RegistryRejection::Registry(RegistryError::NotFound("res.r1".into()))
        );
    }

    #[test]
    fn removing_auction_frees_reservation() {
        let mut reg = registry_with_resource();
        reg.register_auction(auction("a1", 100, 200)).unwrap();
        reg.remove_auction(&key("auctions", "a1")).unwrap();
        reg.register_auction(auction("a2", 120, 180)).unwrap();
    }

    #[test]
    fn reference_counting_survives_archival() {
        let mut reg = registry_with_resource();
        let k = key("auctions", "a1");
        reg.register_auction(auction("a1", 0, 100)).unwrap();

        assert_eq!(reg.add_auction_ref(&k).unwrap(), 1);
        assert_eq!(reg.add_auction_ref(&k).unwrap(), 2);
        assert_eq!(reg.release_auction_ref(&k).unwrap(), 1);

        reg.remove_auction(&k).unwrap();
        assert!(reg.add_auction_ref(&k).is_err());
        assert_eq!(reg.release_auction_ref(&k).unwrap(), 0);
        assert_eq!(
            reg.release_auction_ref(&k).unwrap_err(),
            RegistryError::ReferenceUnderflow("auctions.a1".into())
        );
    }

    #[test]
    fn applicability_query() {
        let mut reg = registry_with_resource();
        reg.insert(Resource::new(key("res", "r2"))).unwrap();
        reg.register_auction(auction("a", 10, 20)).unwrap();

        let r1 = ResourceSelector::parse("res.r1").unwrap();
        let r2 = ResourceSelector::parse("res.r2").unwrap();
        let any = ResourceSelector::Any;

        assert_eq!(reg.applicable_auctions(&r1, 15, 25).len(), 1);
        assert!(reg.applicable_auctions(&r1, 20, 30).is_empty());
        assert!(reg.applicable_auctions(&r1, 0, 10).is_empty());
        assert_eq!(reg.applicable_auctions(&any, 5, 25).len(), 1);
        assert!(reg.applicable_auctions(&r2, 5, 25).is_empty());

        reg.remove_auction(&key("auctions", "a")).unwrap();
        assert!(reg.applicable_auctions(&any, 5, 25).is_empty());
    }

    #[test]
    fn session_bids_are_archived() {
        let mut reg = ObjectRegistry::new();
        let a1 = key("auctions", "a1");
        for (name, session) in [("b1", "s1"), ("b2", "s1"), ("b3", "s2")] {
            let mut bid = BiddingObject::bid(key("bids", name), a1.clone(), "first_price")
                .with_element(BidElement::new("e", 1.0, 1.0));
            bid.session_id = Some(session.to_string());
            reg.upsert_bidding_object(bid);
        }
        assert_eq!(reg.bids_for_auction(&a1).len(), 3);

        let removed = reg.remove_bids_for_session("s1");
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.bids_for_auction(&a1).len(), 1);
        assert_eq!(reg.archived_len(), 2);
    }

    #[test]
    fn archive_drops_oldest_but_keeps_referenced_auctions() {
        let mut reg = ObjectRegistry::with_archive_capacity(2);
        reg.insert(Resource::new(key("res", "r1"))).unwrap();
        reg.register_auction(auction("a1", 100, 200)).unwrap();
        reg.register_auction(auction("a2", 200, 300)).unwrap();
        let a1 = key("auctions", "a1");
        reg.add_auction_ref(&a1).unwrap();

        reg.remove_auction(&a1).unwrap();
        reg.remove(ObjectKind::Resource, &key("res", "r1")).unwrap();
        reg.remove_auction(&key("auctions", "a2")).unwrap();

        assert_eq!(reg.archived_len(), 2);
        assert!(reg.lookup(ObjectKind::Auction, &a1).is_archived());
        assert!(matches!(
            reg.lookup(ObjectKind::Resource, &key("res", "r1")),
            Lookup::Missing
        ));
        assert!(reg.lookup(ObjectKind::Auction, &key("auctions", "a2")).is_archived());

        // Once unreferenced, a1 is the oldest entry and goes first.
        assert_eq!(reg.release_auction_ref(&a1).unwrap(), 0);
        reg.insert(Resource::new(key("res", "r2"))).unwrap();
        reg.remove(ObjectKind::Resource, &key("res", "r2")).unwrap();
        assert_eq!(reg.archived_len(), 2);
        assert!(matches!(reg.lookup(ObjectKind::Auction, &a1), Lookup::Missing));
        assert!(reg.lookup(ObjectKind::Resource, &key("res", "r2")).is_archived());
    }
}
