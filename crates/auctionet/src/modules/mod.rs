// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in strategies.

pub mod first_price;
pub mod fixed_bidder;

pub use first_price::FirstPrice;
pub use fixed_bidder::FixedBidder;

use crate::module::ModuleLoader;

/// Register every built-in strategy under its module name.
pub fn register_builtin(loader: &ModuleLoader) {
    loader.register(first_price::NAME, || Box::new(FirstPrice::default()));
    loader.register(fixed_bidder::NAME, || Box::new(FixedBidder::default()));
}
