//! Monotonic clock abstraction and the engine's one-shot timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Monotonic time source with a bounded blocking sleep.
///
/// The engine only ever sleeps for short, bounded periods (sub-threshold
/// backoff, STAR retry spacing, transceiver cool-down). Anything longer is a
/// timer.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Timers owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Backoff too long to sleep through; re-issue CCA on expiry.
    CcaDelay,
    /// Quiet period after a time-set broadcast.
    TimeSetBlocking,
    /// Random delay before answering a broadcast time query.
    TimeDiversity,
    /// Throttle interval rollover (or end of a suspension).
    ThrottleInterval,
    /// Next periodic link-parameter broadcast.
    LinkParams,
    /// Gap enforced between consecutive transmissions.
    TxPacketDelay,
}

/// Set of one-shot timers keyed by [`TimerId`]. Starting a running timer
/// restarts it.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerId, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, id: TimerId, now: Instant, after: Duration) {
        self.deadlines.insert(id, now + after);
    }

    /// Stop a timer. Returns whether it was running.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.deadlines.remove(&id).is_some()
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.deadlines.get(&id).copied()
    }

    /// Earliest deadline among running timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        for (_, id) in &due {
            self.deadlines.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerId::ThrottleInterval, now, Duration::from_secs(60));
        timers.start(TimerId::TimeSetBlocking, now, Duration::from_millis(5000));
        timers.start(TimerId::CcaDelay, now, Duration::from_millis(700));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(700)));
        assert!(timers.take_expired(now).is_empty());

        let expired = timers.take_expired(now + Duration::from_secs(10));
        assert_eq!(expired, vec![TimerId::CcaDelay, TimerId::TimeSetBlocking]);
        assert!(timers.is_running(TimerId::ThrottleInterval));
        assert!(!timers.is_running(TimerId::CcaDelay));
    }

    #[test]
    fn test_restart_replaces_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerId::TimeDiversity, now, Duration::from_millis(10));
        timers.start(TimerId::TimeDiversity, now, Duration::from_millis(900));
        assert_eq!(
            timers.deadline(TimerId::TimeDiversity),
            Some(now + Duration::from_millis(900))
        );
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerId::LinkParams, now, Duration::from_secs(1));
        assert!(timers.cancel(TimerId::LinkParams));
        assert!(!timers.cancel(TimerId::LinkParams));
        assert_eq!(timers.next_deadline(), None);
    }
}
