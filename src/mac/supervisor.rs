//! Confirmation timeout supervision and the transceiver liveness watchdog.
//!
//! At most one transceiver confirmation is outstanding at a time. When its
//! deadline passes, [`ConfirmSupervisor::check`] produces a synthetic failure
//! confirmation tagged with a token and pushes the deadline out again, so a
//! real confirmation that was already on its way is still absorbed. Whichever
//! arrives first is accepted; the other no longer matches and is dropped.

use std::time::{Duration, Instant};

use log::warn;

use super::phy::{ConfirmKind, PhyConfirm};

pub const CCA_CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);
pub const DATA_CONFIRM_TIMEOUT: Duration = Duration::from_millis(5000);
pub const RESET_CONFIRM_TIMEOUT: Duration = Duration::from_millis(5000);
/// Grace period added after a synthetic confirmation is generated.
pub const SYNTHETIC_GRACE: Duration = Duration::from_millis(5000);
/// Longest silence tolerated from the transceiver while frames are pending.
pub const PHY_LIVENESS_TIMEOUT: Duration = Duration::from_secs(600);

impl ConfirmKind {
    pub fn timeout(self) -> Duration {
        match self {
            Self::Cca => CCA_CONFIRM_TIMEOUT,
            Self::Data => DATA_CONFIRM_TIMEOUT,
            Self::Reset => RESET_CONFIRM_TIMEOUT,
        }
    }
}

/// Failure confirmation generated when the transceiver went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticConfirm {
    pub token: u32,
    pub confirm: PhyConfirm,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: ConfirmKind,
    deadline: Instant,
    token: u32,
}

#[derive(Debug, Default)]
pub struct ConfirmSupervisor {
    pending: Option<Pending>,
    next_token: u32,
}

impl ConfirmSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a confirmation of `kind`, replacing any previous one.
    pub fn arm(&mut self, kind: ConfirmKind, now: Instant) {
        if let Some(prev) = self.pending {
            warn!("arming {:?} while {:?} still pending", kind, prev.kind);
        }
        self.next_token = self.next_token.wrapping_add(1);
        self.pending = Some(Pending {
            kind,
            deadline: now + kind.timeout(),
            token: self.next_token,
        });
    }

    pub fn pending(&self) -> Option<ConfirmKind> {
        self.pending.map(|p| p.kind)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// Accept a real confirmation. Returns `false` when nothing of that kind
    /// is awaited.
    pub fn on_confirm(&mut self, kind: ConfirmKind) -> bool {
        match self.pending {
            Some(p) if p.kind == kind => {
                self.pending = None;
                true
            }
            _ => {
                warn!("unexpected {:?} confirmation (awaiting {:?})", kind, self.pending());
                false
            }
        }
    }

    /// Accept a synthetic confirmation produced by [`Self::check`]. Only the
    /// one carrying the current token for the awaited kind is accepted.
    pub fn on_synthetic(&mut self, synthetic: &SyntheticConfirm) -> bool {
        match self.pending {
            Some(p) if p.kind == synthetic.confirm.kind() && p.token == synthetic.token => {
                self.pending = None;
                true
            }
            _ => {
                warn!(
                    "stale synthetic {:?} confirmation dropped",
                    synthetic.confirm.kind()
                );
                false
            }
        }
    }

    /// Produce a synthetic failure once the deadline has passed.
    pub fn check(&mut self, now: Instant) -> Option<SyntheticConfirm> {
        let pending = self.pending.as_mut()?;
        if now < pending.deadline {
            return None;
        }
        warn!("{:?} confirmation timed out, synthesizing failure", pending.kind);
        pending.deadline = now + SYNTHETIC_GRACE;
        Some(SyntheticConfirm {
            token: pending.token,
            confirm: PhyConfirm::failure(pending.kind),
        })
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

/// Tracks how long the transceiver has gone without confirming anything
/// while transmit work was accepted.
#[derive(Debug, Default)]
pub struct LivenessWatchdog {
    since: Option<Instant>,
}

impl LivenessWatchdog {
    /// Start watching unless already watching.
    pub fn arm(&mut self, now: Instant) {
        self.since.get_or_insert(now);
    }

    /// Any transceiver confirmation proves it is alive.
    pub fn feed(&mut self) {
        self.since = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.since.map(|since| since + PHY_LIVENESS_TIMEOUT)
    }

    /// Whether the ceiling has been exceeded. Disarms when it fires.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now > deadline => {
                self.since = None;
                true
            }
            _ => false,
        }
    }
}
