//! Closed time windows and the overlap test applied to blocks and the head.

use crate::error::{DumpError, Result};
use crate::tsdb::{BlockMeta, Timestamp};
use std::fmt;

/// An inclusive `[start, end]` window in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    start: Timestamp,
    end: Timestamp,
}

impl Window {
    /// Creates a window. Fails with a config error when `start > end`.
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self> {
        if start > end {
            return Err(DumpError::Config(format!(
                "window start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole representable time range.
    pub const fn full() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// First timestamp in the window.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last timestamp in the window.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// True if `[min, max]` shares at least one timestamp with the window.
    /// Touching boundaries count.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        !(self.end < min || self.start > max)
    }

    /// [`Window::overlaps`] applied to a block's metadata.
    pub fn overlaps_meta(&self, meta: &BlockMeta) -> bool {
        self.overlaps(meta.min_time, meta.max_time)
    }

    /// The part of `[min, max]` inside the window, if any.
    pub fn intersect(&self, min: Timestamp, max: Timestamp) -> Option<(Timestamp, Timestamp)> {
        let lo = self.start.max(min);
        let hi = self.end.min(max);
        (lo <= hi).then_some((lo, hi))
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::full()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
