//! Watermark ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A closed interval of instance watermarks.
///
/// Watermarks are assigned by the store in increasing order as instances are
/// committed, so a range identifies a contiguous slice of the ingestion
/// history. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkRange {
    /// Lowest watermark, inclusive.
    pub start: i64,
    /// Highest watermark, inclusive.
    pub end: i64,
}

impl WatermarkRange {
    /// Creates a range; the bounds are swapped if given in the wrong order.
    pub fn new(start: i64, end: i64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// A range covering one watermark.
    pub fn single(watermark: i64) -> Self {
        Self {
            start: watermark,
            end: watermark,
        }
    }

    /// Number of watermarks in the range.
    pub fn count(&self) -> i64 {
        self.end - self.start + 1
    }

    /// True if `watermark` lies in the range.
    pub fn contains(&self, watermark: i64) -> bool {
        self.start <= watermark && watermark <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &WatermarkRange) -> WatermarkRange {
        WatermarkRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for WatermarkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
