use serde::{Deserialize, Serialize};

use crate::error::OutputError;

/// An inclusive range of row positions. A single row has `start == end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Build a range from floating coordinates as computed by a scrolling view.
    ///
    /// Rejects NaN, infinite, negative and inverted bounds. Fractions are truncated.
    pub fn from_bounds(start: f64, end: f64) -> Result<Self, OutputError> {
        let valid = |v: f64| v.is_finite() && v >= 0.0;
        if !valid(start) || !valid(end) || start > end {
            return Err(OutputError::MalformedRange { start, end });
        }
        Ok(Self::new(start as u64, end as u64))
    }

    /// Error unless `start <= end`
    pub fn validate(&self) -> Result<(), OutputError> {
        if self.start > self.end {
            return Err(OutputError::MalformedRange {
                start: self.start as f64,
                end: self.end as f64,
            });
        }
        Ok(())
    }

    /// Number of positions covered
    pub fn len(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.start && position <= self.end
    }

    /// True if `other` lies fully inside this range
    pub fn covers(&self, other: &Range) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn positions(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Number of decimal digits of `count`, used to size the row-number gutter
pub fn count_rank(count: u64) -> usize {
    count.to_string().len()
}
