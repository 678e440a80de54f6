// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// First-price allocation: highest unit prices win until capacity runs out,
// each winner paying its own price.
//
// Parameters (module group or auction params):
//   capacity       total quantity sold per window (default 1)
//   reserve_price  minimum unit price accepted (default 0)

use crate::error::ModuleError;
use crate::module::{AllocationModule, ModuleConfig, ModuleRole};
use crate::object::{BidElement, BiddingObject, ObjectKey};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NAME: &str = "first_price";

/// Key set of the allocations this module emits.
pub const ALLOCATION_SET: &str = "allocations";

#[derive(Debug, Default)]
pub struct FirstPrice {
    executions: AtomicU64,
}

impl FirstPrice {
    /// Number of executions since the last reset.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    fn settings(&self, config: &ModuleConfig) -> Result<(f64, f64), ModuleError> {
        let capacity: f64 = config.parse_or(NAME, "capacity", 1.0)?;
        let reserve: f64 = config.parse_or(NAME, "reserve_price", 0.0)?;
        if !(capacity >= 0.0) || !(reserve >= 0.0) {
            return Err(ModuleError::InvalidConfig {
                module: NAME.to_string(),
                reason: "capacity and reserve_price must be non-negative".into(),
            });
        }
        Ok((capacity, reserve))
    }
}

impl AllocationModule for FirstPrice {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Allocator
    }

    fn init(&self, config: &ModuleConfig) -> Result<(), ModuleError> {
        self.settings(config).map(|_| ())
    }

    fn execute(
        &self,
        config: &ModuleConfig,
        auction: &ObjectKey,
        start: u64,
        stop: u64,
        bids: &[BiddingObject],
    ) -> Result<Vec<BiddingObject>, ModuleError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let (capacity, reserve) = self.settings(config)?;

        // (bid index, element) for every element clearing the reserve.
        let mut offers: Vec<(usize, &BidElement)> = bids
            .iter()
            .enumerate()
            .flat_map(|(i, bid)| bid.elements.iter().map(move |e| (i, e)))
            .filter(|(_, e)| e.quantity > 0.0 && e.unit_price >= reserve)
            .collect();
        offers.sort_by(|(ia, a), (ib, b)| {
            b.unit_price
                .partial_cmp(&a.unit_price)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| bids[*ia].key().cmp(bids[*ib].key()))
        });

        let mut remaining = capacity;
        let mut won: Vec<Option<BiddingObject>> = vec![None; bids.len()];
        for (i, element) in offers {
            if remaining <= 0.0 {
                break;
            }
            let quantity = element.quantity.min(remaining);
            remaining -= quantity;

            let bid = &bids[i];
            let allocation = won[i].get_or_insert_with(|| {
                let key = ObjectKey::new(ALLOCATION_SET, format!("{}@{}", bid.key(), start));
                let mut alloc = BiddingObject::allocation(key, auction.clone(), NAME).with_window(start, stop);
                alloc.session_id = bid.session_id.clone();
                alloc
            });
            allocation
                .elements
                .push(BidElement::new(element.name.clone(), quantity, element.unit_price));
        }

        tracing::trace!(
            "first_price {} [{}, {}): {} bids, {} left unsold",
            auction,
            start,
            stop,
            bids.len(),
            remaining
        );
        Ok(won.into_iter().flatten().collect())
    }

    fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(name: &str, session: &str, elements: &[(f64, f64)]) -> BiddingObject {
        let mut b = BiddingObject::bid(
            ObjectKey::new("bids", name),
            ObjectKey::new("auctions", "a1"),
            NAME,
        );
        for (i, (q, p)) in elements.iter().enumerate() {
            b = b.with_element(BidElement::new(format!("e{}", i), *q, *p));
        }
        b.session_id = Some(session.to_string());
        b
    }

    #[test]
    fn highest_price_wins_up_to_capacity() {
        let module = FirstPrice::default();
        let config = ModuleConfig::new().with("capacity", "3");
        let bids = vec![
            bid("low", "s1", &[(2.0, 1.0)]),
            bid("high", "s2", &[(2.0, 5.0)]),
            bid("mid", "s3", &[(2.0, 3.0)]),
        ];
        let auction = ObjectKey::new("auctions", "a1");
        let allocs = module.execute(&config, &auction, 100, 200, &bids).unwrap();

        assert_eq!(allocs.len(), 2);
        let high = allocs.iter().find(|a| a.session_id.as_deref() == Some("s2")).unwrap();
        assert_eq!(high.total_quantity(), 2.0);
        assert_eq!(high.elements[0].unit_price, 5.0);
        let mid = allocs.iter().find(|a| a.session_id.as_deref() == Some("s3")).unwrap();
        assert_eq!(mid.total_quantity(), 1.0);
        assert!(allocs.iter().all(|a| a.start == 100 && a.stop == 200 && a.auction == auction));
        assert_eq!(module.executions(), 1);
        module.reset();
        assert_eq!(module.executions(), 0);
    }

    #[test]
    fn reserve_price_filters_and_empty_bids_allocate_nothing() {
        let module = FirstPrice::default();
        let config = ModuleConfig::new().with("reserve_price", "2.5");
        let auction = ObjectKey::new("auctions", "a1");
        let bids = vec![bid("cheap", "s1", &[(1.0, 2.0)])];
        assert!(module.execute(&config, &auction, 0, 10, &bids).unwrap().is_empty());
        assert!(module.execute(&config, &auction, 0, 10, &[]).unwrap().is_empty());
    }

    #[test]
    fn negative_capacity_rejected() {
        let module = FirstPrice::default();
        let err = module
            .init(&ModuleConfig::new().with("capacity", "-1"))
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidConfig { .. }));
    }
}
