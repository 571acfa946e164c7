//! Transmit throttle using a rolling-window token bucket.
//!
//! Tracks a byte budget per interval. At every interval rollover the bytes
//! used during the interval that just ended are pushed into a short history,
//! and the next interval's budget becomes whatever capacity the history leaves
//! over. The sum over the window (history plus the current interval) never
//! exceeds the maximum capacity.
//!
//! # Example
//!
//! ```
//! use srfn_mac::mac::{Framing, ThrottleConfig, TxThrottle};
//!
//! // 10% duty cycle at 9600 bit/s, six one-minute intervals
//! let mut throttle = TxThrottle::new(ThrottleConfig::default());
//!
//! if throttle.try_reserve(100) {
//!     // ... hand the frame to the radio ...
//!     throttle.consume(100, Framing::Srfn);
//! }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use super::phy::Framing;

/// Parameters of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Percentage of airtime allowed over the window.
    pub duty_cycle_percent: u8,
    /// Length of one interval in minutes.
    pub interval_minutes: u8,
    /// Number of intervals in the window (including the current one).
    pub intervals: u8,
    /// Radio bit rate used to convert airtime into bytes.
    pub bit_rate: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            duty_cycle_percent: 10,
            interval_minutes: 1,
            intervals: 6,
            bit_rate: 9600,
        }
    }
}

impl ThrottleConfig {
    /// Bytes that may be sent over the whole window.
    pub fn max_capacity(&self) -> u32 {
        let per_interval = u64::from(self.duty_cycle_percent)
            * u64::from(self.interval_minutes)
            * u64::from(self.bit_rate)
            * 60
            / 8
            / 100;
        (per_interval * u64::from(self.intervals.max(1))).min(u64::from(u32::MAX)) as u32
    }

    /// Duration of a single interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes.max(1)) * 60)
    }

    fn history_len(&self) -> usize {
        usize::from(self.intervals.max(2)) - 1
    }
}

/// Byte budget limiter consulted before every transmission.
#[derive(Debug, Clone)]
pub struct TxThrottle {
    config: ThrottleConfig,
    max_capacity: u32,
    /// Bytes still allowed in the current interval.
    remaining: u32,
    /// Budget the current interval started with.
    interval_budget: u32,
    /// Bytes used by each of the last N-1 completed intervals, oldest first.
    history: VecDeque<u32>,
    history_sum: u32,
    enabled: bool,
}

impl TxThrottle {
    /// Create a throttle in its power-up state: half the capacity is assumed
    /// to have been used, spread evenly over the history.
    pub fn new(config: ThrottleConfig) -> Self {
        let max_capacity = config.max_capacity();
        let initial = max_capacity / 2;
        let len = config.history_len();
        let per_interval = (max_capacity - initial) / len as u32;

        Self {
            config,
            max_capacity,
            remaining: initial,
            interval_budget: initial,
            history: std::iter::repeat(per_interval).take(len).collect(),
            history_sum: per_interval * len as u32,
            enabled: true,
        }
    }

    /// Whether a transmission may start now.
    ///
    /// Allowed when throttling is disabled or any budget is left; a frame
    /// larger than the remaining budget is still let through.
    pub fn try_reserve(&self, bytes: u32) -> bool {
        if !self.enabled {
            return true;
        }
        if self.remaining == 0 {
            return false;
        }
        if bytes > self.remaining {
            debug!(
                "throttle: {} byte frame exceeds remaining {} bytes",
                bytes, self.remaining
            );
        }
        true
    }

    /// Deduct a transmitted frame from the budget. Never underflows.
    pub fn consume(&mut self, bytes: u32, framing: Framing) {
        if self.enabled && self.remaining != 0 {
            let cost = bytes.saturating_add(framing.overhead());
            self.remaining -= cost.min(self.remaining);
            debug!("throttle: {} bytes remaining", self.remaining);
        }
    }

    /// Close the current interval and open the next one.
    pub fn on_interval_rollover(&mut self) {
        let used = self.interval_budget.saturating_sub(self.remaining);
        if let Some(oldest) = self.history.pop_front() {
            self.history_sum = self.history_sum.saturating_sub(oldest);
        }
        self.history.push_back(used);
        self.history_sum = self.history_sum.saturating_add(used);

        self.interval_budget = self.max_capacity.saturating_sub(self.history_sum);
        self.remaining = self.interval_budget;
        self.enabled = true;
        debug!(
            "throttle rollover: used {} bytes, next budget {}",
            used, self.interval_budget
        );
    }

    /// Force a fixed budget (power-constrained operation). Zero restores the
    /// full capacity. The usage history is cleared in both cases.
    pub fn set_override(&mut self, budget: u32) {
        if budget != 0 {
            self.remaining = budget;
            self.interval_budget = budget;
            self.enabled = true;
        } else {
            self.remaining = self.max_capacity;
            self.interval_budget = self.max_capacity;
        }
        self.history.iter_mut().for_each(|entry| *entry = 0);
        self.history_sum = 0;
    }

    /// Stop enforcing the budget until the next rollover.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Resume enforcing the budget where it left off.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bytes left in the current interval.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Budget the current interval started with.
    pub fn interval_budget(&self) -> u32 {
        self.interval_budget
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// Bytes used over the window so far (history plus current interval).
    pub fn window_usage(&self) -> u32 {
        self.history_sum
            .saturating_add(self.interval_budget.saturating_sub(self.remaining))
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}
