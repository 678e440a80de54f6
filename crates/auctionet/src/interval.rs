// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-window math for auctions and resource-request intervals.
//!
//! All timestamps are milliseconds since the UNIX epoch. Functions that
//! need the current time take it as a parameter; runtimes pass [`now_ms`].
//!
//! Windows are half-open: `[start, stop)`. Two windows that only touch at a
//! boundary do not overlap.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stop time of an interval that never ends.
pub const UNBOUNDED: u64 = u64::MAX;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Half-open window overlap: excluded iff `a_end <= b_start` or `b_end <= a_start`.
pub fn windows_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    !(a_end <= b_start || b_end <= a_start)
}

/// How a candidate window overlaps an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapKind {
    /// Candidate lies entirely inside the existing window.
    Within,
    /// Candidate fully covers the existing window.
    Containing,
    /// Windows share only part of their span.
    Partial,
}

impl OverlapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Within => "contained within",
            Self::Containing => "containing",
            Self::Partial => "partial overlap",
        }
    }
}

/// Interval as written in a definition, before resolution.
///
/// At most two of `start`, `stop` and `duration_ms` may be given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub stop: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Repeat period (0 = a single execution over the whole window).
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub align: bool,
}

impl IntervalSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn stop(mut self, stop: u64) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn every(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn aligned(mut self, align: bool) -> Self {
        self.align = align;
        self
    }

    /// Resolve into a concrete [`Interval`] relative to `now`.
    ///
    /// The missing bound is derived from the two given ones. A start in the
    /// past is clamped to `now`; a stop that is not after `now` means the
    /// object has already expired.
    pub fn resolve(&self, now: u64) -> Result<Interval, ValidationError> {
        let (start, stop) = match (self.start, self.stop, self.duration_ms) {
            (Some(_), Some(_), Some(_)) => return Err(ValidationError::IntervalOverSpecified),
            (Some(start), Some(stop), None) => (start, stop),
            (Some(start), None, Some(duration)) => (start, start.saturating_add(duration)),
            (None, Some(stop), Some(duration)) => (stop.saturating_sub(duration), stop),
            (Some(start), None, None) => (start, UNBOUNDED),
            (None, Some(stop), None) => (now, stop),
            (None, None, Some(duration)) => (now, now.saturating_add(duration)),
            (None, None, None) => (now, UNBOUNDED),
        };

        if stop <= now {
            return Err(ValidationError::IntervalExpired { stop, now });
        }
        let start = start.max(now);
        if start > stop {
            return Err(ValidationError::IntervalInverted { start, stop });
        }

        Ok(Interval {
            start,
            stop,
            interval_ms: self.interval_ms,
            align: self.align,
        })
    }
}

/// A resolved scheduling window with an optional repeat period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub stop: u64,
    /// Repeat period in milliseconds (0 = once over the whole window).
    pub interval_ms: u64,
    pub align: bool,
}

impl Interval {
    /// Build an interval without clamping; `start` must not exceed `stop`.
    pub fn new(start: u64, stop: u64, interval_ms: u64) -> Result<Self, ValidationError> {
        if start > stop {
            return Err(ValidationError::IntervalInverted { start, stop });
        }
        Ok(Self {
            start,
            stop,
            interval_ms,
            align: false,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_unbounded(&self) -> bool {
        self.stop == UNBOUNDED
    }

    pub fn contains(&self, t: u64) -> bool {
        self.start <= t && t < self.stop
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.stop <= now
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        windows_overlap(self.start, self.stop, other.start, other.stop)
    }

    pub fn overlaps_window(&self, start: u64, end: u64) -> bool {
        windows_overlap(self.start, self.stop, start, end)
    }

    /// Classify how `self` (the candidate) overlaps `existing`.
    pub fn overlap_with(&self, existing: &Interval) -> Option<OverlapKind> {
        if !self.overlaps(existing) {
            return None;
        }
        if self.start >= existing.start && self.stop <= existing.stop {
            Some(OverlapKind::Within)
        } else if self.start <= existing.start && self.stop >= existing.stop {
            Some(OverlapKind::Containing)
        } else {
            Some(OverlapKind::Partial)
        }
    }

    /// Start of the first execution window.
    ///
    /// With `align` set and a repeat period, the start is rounded up to the
    /// next multiple of the period when that still falls inside the window.
    pub fn first_tick(&self) -> u64 {
        if !self.align || self.interval_ms == 0 {
            return self.start;
        }
        let aligned = self
            .start
            .div_ceil(self.interval_ms)
            .saturating_mul(self.interval_ms);
        if aligned < self.stop {
            aligned
        } else {
            self.start
        }
    }

    /// Execution window starting at `tick_start`, clipped to the stop time.
    pub fn tick_window(&self, tick_start: u64) -> (u64, u64) {
        let end = if self.interval_ms == 0 {
            self.stop
        } else {
            tick_start.saturating_add(self.interval_ms).min(self.stop)
        };
        (tick_start, end)
    }
}
