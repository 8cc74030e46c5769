use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A position on the timeline, in nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * NANOS_PER_SEC as f64).round() as i64)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    /// Move forward by a wall-clock duration
    pub fn saturating_add(self, delta: Duration) -> Self {
        let nanos = i64::try_from(delta.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Move by a signed nanosecond offset
    pub fn saturating_offset(self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Signed distance `self - earlier` in nanoseconds
    pub fn nanos_since(self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Calendar time, when the value is representable
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(NANOS_PER_SEC) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.div_euclid(NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(NANOS_PER_SEC);
        write!(f, "{}.{:09}", secs, nanos)
    }
}

impl From<i64> for Timestamp {
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

/// An inclusive span of the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Build a range, swapping the ends if they arrive reversed
    pub fn new(a: Timestamp, b: Timestamp) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn contains(&self, stamp: Timestamp) -> bool {
        self.start <= stamp && stamp <= self.end
    }

    /// Whether the two ranges share at least one instant
    pub fn intersects(&self, start: Timestamp, end: Option<Timestamp>) -> bool {
        if self.end < start {
            return false;
        }
        match end {
            Some(end) => self.start <= end,
            None => true,
        }
    }

    pub fn clamp(&self, stamp: Timestamp) -> Timestamp {
        stamp.clamp(self.start, self.end)
    }

    /// Smallest range covering both
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Restrict to the part overlapping `outer`, or `None` when disjoint
    pub fn intersection(&self, outer: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(outer.start);
        let end = self.end.min(outer.end);
        (start <= end).then_some(TimeRange { start, end })
    }

    pub fn span_nanos(&self) -> i64 {
        self.end.nanos_since(self.start)
    }
}
