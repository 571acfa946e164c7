//! CSMA/CA channel access.
//!
//! One frame is worked on at a time. Starting from [`AccessState::PhyReady`]
//! the engine picks a channel, asks the transceiver for a clear-channel
//! assessment and, depending on the answer, transmits, backs off and asks
//! again, or gives up.
//!
//! # Algorithm (SRFN framing)
//!
//! 1. Clear channel: draw `u` uniform in `[0, 1)`. Transmit if `u <= p`.
//!    Otherwise fail at once when quick-abort is set, or back off without
//!    counting an attempt.
//! 2. Busy channel: count an attempt and back off.
//! 3. Backoff is uniform in `[min_backoff, max_backoff]` ms. Short backoffs
//!    are slept through, longer ones go through the CCA delay timer.
//! 4. More than `max_attempts` busy answers fail the transaction.
//!
//! STAR framing transmits when the channel is clear or the attempts are used
//! up, retrying every 50 ms otherwise. With `p = 0` and no quick-abort an
//! SRFN frame is effectively never sent and never failed. A frame in channel
//! access is exempt from the transaction timeout, Flush and Purge, so it
//! holds the queue indefinitely.

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::engine::Engine;
use super::frames::{FrameId, FrameManager};
use super::phy::{
    CcaStatus, Channel, ConfirmKind, Framing, PhyDataRequest, PhyDataStatus, Transceiver, TxConstraint,
};
use super::primitives::Confirmation;
use super::random::RandomSource;
use super::timers::{Clock, TimerId};
use super::{channels, time_sync};
use crate::stats::MacCounters;

/// Backoffs below this are slept through instead of using a timer.
pub const SHORT_DELAY_THRESHOLD: Duration = Duration::from_millis(500);
/// Spacing between STAR clear-channel assessments.
pub const STAR_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Where the current transmission attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    PhyReady,
    CcaPending,
    /// Waiting on the CCA delay timer before the next assessment.
    CcaDelay,
    Transmitting,
}

/// State of a single transmission attempt.
#[derive(Debug, Clone)]
pub struct ChannelAccess {
    pub state: AccessState,
    /// Frame being sent; storage stays with the frame manager.
    pub frame: Option<FrameId>,
    pub channel: Channel,
    pub attempts: u8,
    pub channel_clear: bool,
    pub framing: Framing,
    pub submitted_at: Option<Instant>,
}

impl Default for ChannelAccess {
    fn default() -> Self {
        Self {
            state: AccessState::PhyReady,
            frame: None,
            channel: 0,
            attempts: 0,
            channel_clear: false,
            framing: Framing::Srfn,
            submitted_at: None,
        }
    }
}

impl ChannelAccess {
    fn begin(&mut self, frame: FrameId, channel: Channel, framing: Framing) {
        *self = Self {
            frame: Some(frame),
            channel,
            framing,
            ..Self::default()
        };
    }

    /// Back to `PhyReady` with no frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the persistence check decided on a CCA answer.
enum Decision {
    Transmit,
    Backoff,
    Fail,
}

impl<P, F, C, R> Engine<P, F, C, R>
where
    P: Transceiver,
    F: FrameManager,
    C: Clock,
    R: RandomSource,
{
    pub(crate) fn can_start_frame(&self) -> bool {
        self.state.is_operational()
            && !self.state.tx_paused
            && self.state.access.state == AccessState::PhyReady
            && !self.state.supervisor.is_pending()
            && !self.state.timers.is_running(TimerId::TxPacketDelay)
    }

    /// Take the next ready frame and start channel access for it.
    pub(crate) fn start_next_frame(&mut self) -> Option<Confirmation> {
        let id = self.frames.next_ready()?;
        let Some(frame) = self.frames.frame(id) else {
            warn!("frame {:?} vanished before channel access", id);
            return None;
        };

        let time_set = frame.is_time_set();
        let len = frame.payload.len() as u32;
        let framing = frame.framing();
        let skip_cca = frame.skip_cca && framing == Framing::Star;

        if !time_set && !self.state.throttle.try_reserve(len) {
            warn!("throttle budget exhausted, failing frame {:?}", id);
            return self.fail_frame(id);
        }

        let tx_channels = self.phy.tx_channels();
        let sets = self.state.config.channel_sets(frame.channel_sets);
        let Some(channel) =
            channels::pick_channel(&tx_channels, sets, frame.channel_set_index, &mut self.rng)
        else {
            warn!("no transmit channel for frame {:?}", id);
            return self.fail_frame(id);
        };

        self.state.access.begin(id, channel, framing);
        debug!("channel access start: frame {:?} channel {}", id, channel);

        if skip_cca {
            return self.submit_frame();
        }
        self.issue_cca()
    }

    /// Ask the transceiver for a clear-channel assessment.
    pub(crate) fn issue_cca(&mut self) -> Option<Confirmation> {
        let channel = self.state.access.channel;
        match self.phy.cca_request(channel) {
            Ok(()) => {
                self.state.supervisor.arm(ConfirmKind::Cca, self.clock.now());
                self.state.access.state = AccessState::CcaPending;
                None
            }
            Err(e) => {
                warn!("CCA request on channel {} refused: {}", channel, e);
                self.fail_current()
            }
        }
    }

    /// React to a CCA answer while in `CcaPending`.
    pub(crate) fn on_cca_confirm(&mut self, status: CcaStatus, clear: bool) -> Option<Confirmation> {
        if self.state.access.state != AccessState::CcaPending {
            warn!("CCA confirm in state {:?}", self.state.access.state);
            return None;
        }
        let clear = status == CcaStatus::Success && clear;
        self.state.access.channel_clear = clear;

        match self.state.access.framing {
            Framing::Star => self.star_cca(clear),
            Framing::Srfn => self.srfn_cca(clear),
        }
    }

    fn star_cca(&mut self, clear: bool) -> Option<Confirmation> {
        let access = &mut self.state.access;
        if clear || access.attempts >= self.state.config.csma_max_attempts {
            return self.submit_frame();
        }
        access.attempts += 1;
        debug!("STAR channel busy, attempt {}", access.attempts);
        self.clock.sleep(STAR_RETRY_DELAY);
        self.issue_cca()
    }

    fn srfn_cca(&mut self, clear: bool) -> Option<Confirmation> {
        let config = &self.state.config;
        let decision = if clear {
            let draw = self.rng.unit();
            if draw <= config.csma_p_value {
                Decision::Transmit
            } else if config.csma_quick_abort {
                debug!("persistence declined ({:.3}), quick abort", draw);
                Decision::Fail
            } else {
                debug!("persistence declined ({:.3})", draw);
                Decision::Backoff
            }
        } else {
            self.state.access.attempts += 1;
            debug!("channel busy, attempt {}", self.state.access.attempts);
            Decision::Backoff
        };

        match decision {
            Decision::Transmit => {
                if self.current_is_time_set() {
                    let now = self.clock.now();
                    self.state
                        .timers
                        .start(TimerId::TimeSetBlocking, now, time_sync::BLOCKING_WINDOW);
                    debug!("time set passed persistence, blocking window started");
                }
                self.submit_frame()
            }
            Decision::Fail => self.fail_current(),
            Decision::Backoff => self.backoff(),
        }
    }

    fn backoff(&mut self) -> Option<Confirmation> {
        let config = &self.state.config;
        if self.state.access.attempts > config.csma_max_attempts {
            warn!(
                "channel access failed after {} attempts",
                self.state.access.attempts
            );
            MacCounters::incr(&self.state.counters.channel_access_failures);
            return self.fail_current();
        }

        let ms = self.rng.range_inclusive(
            u32::from(config.csma_min_backoff_ms),
            u32::from(config.csma_max_backoff_ms),
        );
        let delay = Duration::from_millis(u64::from(ms));
        if delay < SHORT_DELAY_THRESHOLD {
            self.clock.sleep(delay);
            self.issue_cca()
        } else {
            let now = self.clock.now();
            self.state.timers.start(TimerId::CcaDelay, now, delay);
            self.state.access.state = AccessState::CcaDelay;
            debug!("backoff {}ms via timer", ms);
            None
        }
    }

    /// CCA delay timer fired.
    pub(crate) fn on_cca_delay_expired(&mut self) -> Option<Confirmation> {
        if self.state.access.state != AccessState::CcaDelay {
            return None;
        }
        self.issue_cca()
    }

    fn current_is_time_set(&self) -> bool {
        self.state
            .access
            .frame
            .and_then(|id| self.frames.frame(id))
            .map_or(false, |frame| frame.is_time_set())
    }

    /// Hand the current frame to the transceiver.
    fn submit_frame(&mut self) -> Option<Confirmation> {
        let Some(id) = self.state.access.frame else {
            self.state.access.reset();
            return None;
        };
        let Some(frame) = self.frames.frame(id) else {
            warn!("frame {:?} vanished before submission", id);
            self.state.access.reset();
            return None;
        };

        let time_set = frame.is_time_set();
        let len = frame.payload.len() as u32;
        if !time_set && !self.state.throttle.try_reserve(len) {
            warn!("throttle denied frame {:?} at submission", id);
            return self.fail_current();
        }

        let request = PhyDataRequest {
            channel: self.state.access.channel,
            dst: frame.dst,
            is_command: frame.is_command_frame(),
            payload: &frame.payload,
            framing: self.state.access.framing,
            constraint: if time_set {
                TxConstraint::Exact
            } else {
                TxConstraint::Regular
            },
        };

        match self.phy.data_request(&request) {
            Ok(()) => {
                let now = self.clock.now();
                self.state.throttle.consume(len, self.state.access.framing);
                self.state
                    .supervisor
                    .arm(ConfirmKind::Data, now);
                self.state.access.state = AccessState::Transmitting;
                self.state.access.submitted_at = Some(now);
                debug!(
                    "frame {:?} submitted on channel {}",
                    id, self.state.access.channel
                );
                None
            }
            Err(e) => {
                warn!("data request for frame {:?} refused: {}", id, e);
                self.fail_current()
            }
        }
    }

    /// React to a transmit confirmation while in `Transmitting`.
    pub(crate) fn on_data_confirm(
        &mut self,
        status: PhyDataStatus,
        delay_ms: u32,
    ) -> Option<Confirmation> {
        if self.state.access.state != AccessState::Transmitting {
            warn!("data confirm in state {:?}", self.state.access.state);
            return None;
        }
        let Some(id) = self.state.access.frame else {
            self.state.access.reset();
            return None;
        };

        if let Some(at) = self.state.access.submitted_at {
            debug!(
                "frame {:?} confirmed {:?} after submission",
                id,
                self.clock.now().saturating_duration_since(at)
            );
        }
        let completion = match status {
            PhyDataStatus::Success => {
                MacCounters::incr(&self.state.counters.tx_frames);
                self.frames.confirm(id, true)
            }
            PhyDataStatus::Busy | PhyDataStatus::ThermalOverride => {
                debug!("transmitter {:?}, resending after {}ms", status, delay_ms);
                MacCounters::incr(&self.state.counters.tx_link_delay_count);
                MacCounters::add(&self.state.counters.tx_link_delay_time_ms, delay_ms);
                self.frames.mark_resend(id);
                self.state.access.reset();
                self.clock.sleep(Duration::from_millis(u64::from(delay_ms)));
                return None;
            }
            other => {
                warn!("transmission of frame {:?} failed: {:?}", id, other);
                self.frames.confirm(id, false)
            }
        };

        self.state.access.reset();
        let gap = self.state.config.tx_packet_delay_ms;
        if gap > 0 {
            let now = self.clock.now();
            self.state.timers.start(
                TimerId::TxPacketDelay,
                now,
                Duration::from_millis(u64::from(gap)),
            );
        }
        completion.and_then(|c| self.finish(c))
    }

    /// Fail the frame currently being worked on and return to `PhyReady`.
    pub(crate) fn fail_current(&mut self) -> Option<Confirmation> {
        let frame = self.state.access.frame.take();
        self.state.access.reset();
        self.state.timers.cancel(TimerId::CcaDelay);
        frame.and_then(|id| self.fail_frame(id))
    }

    fn fail_frame(&mut self, id: FrameId) -> Option<Confirmation> {
        self.state.access.reset();
        self.frames.fail(id).and_then(|c| self.finish(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_begin_resets_attempts() {
        let mut access = ChannelAccess {
            attempts: 4,
            channel_clear: true,
            ..Default::default()
        };
        access.state = AccessState::CcaDelay;
        let mut queue = crate::mac::frames::TxQueue::default();
        let id = queue
            .create(
                crate::mac::frames::Transaction::command(
                    crate::mac::commands::CommandId::TimeReq,
                    crate::mac::primitives::Destination::Broadcast,
                    vec![1],
                ),
                Instant::now(),
            )
            .unwrap();
        access.begin(id, 12, Framing::Star);
        assert_eq!(access.state, AccessState::PhyReady);
        assert_eq!(access.attempts, 0);
        assert!(!access.channel_clear);
        assert_eq!(access.framing, Framing::Star);
        assert_eq!(access.frame, Some(id));
    }
}
