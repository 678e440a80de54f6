// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Fixed-budget bidder: offers the same quantity on every offered auction,
// pricing each unit at budget / quantity, capped by max_price.
//
// Request interval parameters:
//   budget    total willingness to pay per auction (default 1)
//   quantity  units wanted per auction (default 1)
//   element   element name (default "unit")
// Module group:
//   max_price optional unit price cap

use crate::error::ModuleError;
use crate::module::{AllocationModule, ModuleConfig, ModuleRole};
use crate::object::{Auction, BidElement, BiddingObject, ObjectKey};
use std::collections::BTreeMap;

pub const NAME: &str = "fixed_bidder";

/// Key set of the bids this module emits.
pub const BID_SET: &str = "bids";

#[derive(Debug, Default)]
pub struct FixedBidder;

fn param_f64(params: &BTreeMap<String, String>, key: &str, default: f64) -> Result<f64, ModuleError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v > 0.0 => Ok(v),
            _ => Err(ModuleError::Failed {
                module: NAME.to_string(),
                reason: format!("request parameter {} = {:?} must be a positive number", key, raw),
            }),
        },
    }
}

impl AllocationModule for FixedBidder {
    fn name(&self) -> &str {
        NAME
    }

    fn role(&self) -> ModuleRole {
        ModuleRole::Bidder
    }

    fn init(&self, config: &ModuleConfig) -> Result<(), ModuleError> {
        config.parse_or(NAME, "max_price", f64::INFINITY).map(|_| ())
    }

    fn execute_for_agent(
        &self,
        config: &ModuleConfig,
        params: &BTreeMap<String, String>,
        auctions: &[Auction],
        start: u64,
        stop: u64,
    ) -> Result<Vec<BiddingObject>, ModuleError> {
        let budget = param_f64(params, "budget", 1.0)?;
        let quantity = param_f64(params, "quantity", 1.0)?;
        let element = params.get("element").map(String::as_str).unwrap_or("unit");
        let max_price: f64 = config.parse_or(NAME, "max_price", f64::INFINITY)?;
        let unit_price = (budget / quantity).min(max_price);

        Ok(auctions
            .iter()
            .map(|auction| {
                let window_start = start.max(auction.interval.start);
                let window_stop = stop.min(auction.interval.stop);
                BiddingObject::bid(
                    ObjectKey::new(BID_SET, auction.key().name()),
                    auction.key().clone(),
                    auction.module.clone(),
                )
                .with_element(BidElement::new(element, quantity, unit_price))
                .with_window(window_start, window_stop)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;

    fn auction(name: &str, start: u64, stop: u64) -> Auction {
        Auction::new(
            ObjectKey::new("auctions", name),
            ObjectKey::new("res", "bw"),
            "first_price",
            Interval::new(start, stop, 10).unwrap(),
        )
    }

    #[test]
    fn one_bid_per_auction_with_clipped_window() {
        let mut params = BTreeMap::new();
        params.insert("budget".to_string(), "10".to_string());
        params.insert("quantity".to_string(), "4".to_string());
        let bids = FixedBidder
            .execute_for_agent(
                &ModuleConfig::new(),
                &params,
                &[auction("a1", 0, 100), auction("a2", 50, 500)],
                20,
                300,
            )
            .unwrap();

        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].auction, ObjectKey::new("auctions", "a1"));
        assert_eq!(bids[0].module, "first_price");
        assert_eq!((bids[0].start, bids[0].stop), (20, 100));
        assert_eq!((bids[1].start, bids[1].stop), (50, 300));
        assert_eq!(bids[1].elements[0].unit_price, 2.5);
        assert_eq!(bids[1].elements[0].quantity, 4.0);
    }

    #[test]
    fn price_capped_and_bad_params_rejected() {
        let mut params = BTreeMap::new();
        params.insert("budget".to_string(), "100".to_string());
        let config = ModuleConfig::new().with("max_price", "3");
        let bids = FixedBidder
            .execute_for_agent(&config, &params, &[auction("a1", 0, 100)], 0, 100)
            .unwrap();
        assert_eq!(bids[0].elements[0].unit_price, 3.0);

        params.insert("quantity".to_string(), "0".to_string());
        assert!(FixedBidder
            .execute_for_agent(&config, &params, &[auction("a1", 0, 100)], 0, 100)
            .is_err());
    }

    #[test]
    fn does_not_allocate() {
        let err = FixedBidder
            .execute(&ModuleConfig::new(), &ObjectKey::new("auctions", "a1"), 0, 1, &[])
            .unwrap_err();
        assert!(matches!(err, ModuleError::Failed { .. }));
    }
}
