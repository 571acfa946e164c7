//! Reliability levels and their retransmission counts.
//!
//! The reliability selector on a data request does not change how the channel
//! is accessed. It tells the frame manager how many extra times a frame is
//! sent after its first transmission.

use serde::{Deserialize, Serialize};

/// Highest retry count accepted for any level.
pub const MAX_RETRY_COUNT: u8 = 7;

/// Coarse QoS selector carried by a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Low,
    Medium,
    High,
}

impl Default for Reliability {
    fn default() -> Self {
        Self::Low
    }
}

/// Retry count per reliability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryCounts {
    pub low: u8,
    pub medium: u8,
    pub high: u8,
}

impl Default for RetryCounts {
    fn default() -> Self {
        Self {
            low: 0,
            medium: 1,
            high: 2,
        }
    }
}

impl RetryCounts {
    /// Number of retransmissions for the given level.
    pub fn retry_count(&self, level: Reliability) -> u8 {
        match level {
            Reliability::Low => self.low,
            Reliability::Medium => self.medium,
            Reliability::High => self.high,
        }
    }

    /// Update one level. Returns `false` (and leaves the value untouched)
    /// when `count` exceeds [`MAX_RETRY_COUNT`].
    pub fn set(&mut self, level: Reliability, count: u8) -> bool {
        if count > MAX_RETRY_COUNT {
            return false;
        }
        match level {
            Reliability::Low => self.low = count,
            Reliability::Medium => self.medium = count,
            Reliability::High => self.high = count,
        }
        true
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.low <= MAX_RETRY_COUNT && self.medium <= MAX_RETRY_COUNT && self.high <= MAX_RETRY_COUNT
    }
}
