// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON definition files for resources, auctions and resource requests.
//!
//! ```json
//! {
//!   "resources": [{ "key": "res.bw" }],
//!   "auctions": [{
//!     "key": "auctions.bw1", "resource": "res.bw", "module": "first_price",
//!     "duration_ms": 60000, "interval_ms": 10000,
//!     "params": { "capacity": "10" }
//!   }],
//!   "requests": [{
//!     "key": "requests.r1", "resource": "any", "module": "fixed_bidder",
//!     "intervals": [{ "duration_ms": 30000, "interval_ms": 10000,
//!                     "params": { "budget": "20" } }]
//!   }]
//! }
//! ```
//!
//! Intervals are resolved against the load time. Definitions that fail
//! validation are reported individually and never registered.

use crate::config::ConfigError;
use crate::error::ValidationError;
use crate::interval::IntervalSpec;
use crate::object::{
    Auction, ObjectKey, RequestInterval, Resource, ResourceRequest, ResourceSelector, ANY_RESOURCE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDef {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionDef {
    pub key: String,
    pub resource: String,
    pub module: String,
    #[serde(flatten)]
    pub interval: IntervalSpec,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIntervalDef {
    #[serde(flatten)]
    pub interval: IntervalSpec,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDef {
    pub key: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    pub module: String,
    pub intervals: Vec<RequestIntervalDef>,
}

fn default_resource() -> String {
    ANY_RESOURCE.to_string()
}

/// A definition that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{key}: {error}")]
pub struct Rejected {
    pub key: String,
    #[source]
    pub error: ValidationError,
}

/// Objects built from definitions plus the ones rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub objects: Vec<T>,
    pub rejected: Vec<Rejected>,
}

impl<T> Loaded<T> {
    fn collect(items: impl Iterator<Item = Result<T, Rejected>>) -> Self {
        let mut objects = Vec::new();
        let mut rejected = Vec::new();
        for item in items {
            match item {
                Ok(obj) => objects.push(obj),
                Err(r) => rejected.push(r),
            }
        }
        Self { objects, rejected }
    }
}

/// What a runtime registered from one definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub resources: usize,
    pub auctions: usize,
    pub requests: usize,
    /// `"key: reason"` for every definition that was not registered.
    pub rejected: Vec<String>,
}

/// Contents of one definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
    #[serde(default)]
    pub auctions: Vec<AuctionDef>,
    #[serde(default)]
    pub requests: Vec<RequestDef>,
}

impl Definitions {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn resources(&self) -> Loaded<Resource> {
        Loaded::collect(self.resources.iter().map(|def| {
            ObjectKey::parse(&def.key)
                .map(Resource::new)
                .map_err(|error| Rejected {
                    key: def.key.clone(),
                    error,
                })
        }))
    }

    pub fn auctions(&self, now: u64) -> Loaded<Auction> {
        Loaded::collect(self.auctions.iter().map(|def| {
            let build = || -> Result<Auction, ValidationError> {
                let key = ObjectKey::parse(&def.key)?;
                let resource = ObjectKey::parse(&def.resource)?;
                if def.module.is_empty() {
                    return Err(ValidationError::Invalid("module name is empty".into()));
                }
                let interval = def.interval.resolve(now)?;
                let mut auction = Auction::new(key, resource, def.module.clone(), interval);
                auction.params = def.params.clone();
                Ok(auction)
            };
            build().map_err(|error| Rejected {
                key: def.key.clone(),
                error,
            })
        }))
    }

    pub fn requests(&self, now: u64) -> Loaded<ResourceRequest> {
        Loaded::collect(self.requests.iter().map(|def| {
            let build = || -> Result<ResourceRequest, ValidationError> {
                let key = ObjectKey::parse(&def.key)?;
                let selector = ResourceSelector::parse(&def.resource)?;
                if def.intervals.is_empty() {
                    return Err(ValidationError::Invalid("request has no intervals".into()));
                }
                let mut request = ResourceRequest::new(key, selector, def.module.clone());
                for iv in &def.intervals {
                    let mut interval = RequestInterval::new(iv.interval.resolve(now)?);
                    interval.params = iv.params.clone();
                    request = request.with_interval(interval);
                }
                Ok(request)
            };
            build().map_err(|error| Rejected {
                key: def.key.clone(),
                error,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    const SAMPLE: &str = r#"{
        "resources": [{ "key": "res.bw" }, { "key": "broken" }],
        "auctions": [
            { "key": "auctions.a1", "resource": "res.bw", "module": "first_price",
              "duration_ms": 60000, "interval_ms": 10000, "params": { "capacity": "5" } },
            { "key": "auctions.old", "resource": "res.bw", "module": "first_price",
              "start": 1, "stop": 2 },
            { "key": "auctions.over", "resource": "res.bw", "module": "first_price",
              "start": 1, "stop": 2, "duration_ms": 1 }
        ],
        "requests": [
            { "key": "requests.r1", "module": "fixed_bidder",
              "intervals": [{ "duration_ms": 5000, "params": { "budget": "3" } }] }
        ]
    }"#;

    #[test]
    fn sample_file_loads_with_rejections() {
        let defs = Definitions::from_json_str(SAMPLE).unwrap();

        let resources = defs.resources();
        assert_eq!(resources.objects.len(), 1);
        assert_eq!(resources.rejected[0].key, "broken");

        let auctions = defs.auctions(NOW);
        assert_eq!(auctions.objects.len(), 1);
        let a1 = &auctions.objects[0];
        assert_eq!(a1.interval.start, NOW);
        assert_eq!(a1.interval.stop, NOW + 60_000);
        assert_eq!(a1.params["capacity"], "5");
        assert_eq!(auctions.rejected.len(), 2);
        assert!(matches!(
            auctions.rejected[0].error,
            ValidationError::IntervalExpired { .. }
        ));
        assert_eq!(auctions.rejected[1].error, ValidationError::IntervalOverSpecified);

        let requests = defs.requests(NOW);
        let r1 = &requests.objects[0];
        assert_eq!(r1.resource, ResourceSelector::Any);
        assert_eq!(r1.intervals[0].interval.stop, NOW + 5_000);
        assert_eq!(r1.intervals[0].params["budget"], "3");
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            Definitions::from_json_str("{ \"auctions\": 3 }"),
            Err(ConfigError::Json(_))
        ));
        assert_eq!(Definitions::from_json_str("{}").unwrap(), Definitions::default());
    }
}
