//! Time-set distribution.
//!
//! A node acting as a time source pushes TIME_SET command frames, either on
//! its own initiative or in answer to a neighbour's TIME_REQ. At most one
//! time-set transaction is queued at a time. Once a time set passes the
//! persistence check a 5 s blocking window opens; a push that arrives inside
//! the window is remembered and sent as a broadcast when the window closes.

use std::time::Duration;

use log::{debug, info, warn};

use super::channels;
use super::commands::{self, CommandId};
use super::config::TimeQueryResponseMode;
use super::engine::Engine;
use super::frames::{FrameManager, Transaction};
use super::phy::Transceiver;
use super::primitives::{ChannelSetIndex, ChannelSets, Destination, MacAddress, TimePushStatus};
use super::random::RandomSource;
use super::timers::{Clock, TimerId};
use crate::stats::MacCounters;

/// Quiet period after a time set is cleared for transmission.
pub const BLOCKING_WINDOW: Duration = Duration::from_millis(5000);

/// This node's role in time distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRole {
    #[default]
    None,
    Source,
    Sink,
    Both,
}

impl TimeRole {
    pub fn is_source(self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }
}

/// Time-keeping state reported by the time module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeAuthority {
    pub role: TimeRole,
    /// Whether the local clock holds a trustworthy time.
    pub time_valid: bool,
}

impl TimeAuthority {
    pub fn can_push(&self) -> bool {
        self.role.is_source() && self.time_valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Broadcast,
    Unicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PushTarget {
    mode: PushMode,
    origin: Option<MacAddress>,
}

/// Bookkeeping for pending time pushes.
#[derive(Debug, Default)]
pub struct TimeSync {
    in_queue: bool,
    resend_pending: bool,
    in_diversity: bool,
    deferred: Option<PushTarget>,
    link_params_after: bool,
}

impl TimeSync {
    /// A time-set transaction is waiting in the queue.
    pub fn in_queue(&self) -> bool {
        self.in_queue
    }

    pub fn resend_pending(&self) -> bool {
        self.resend_pending
    }
}

impl<P, F, C, R> Engine<P, F, C, R>
where
    P: Transceiver,
    F: FrameManager,
    C: Clock,
    R: RandomSource,
{
    /// Queue a TIME_SET frame.
    ///
    /// `origin` is the node whose TIME_REQ is being answered. With a non-zero
    /// `diversity_ms` the push is deferred by that long and reported as
    /// [`TimePushStatus::Pending`].
    pub fn push_time(
        &mut self,
        mode: PushMode,
        origin: Option<MacAddress>,
        diversity_ms: u32,
    ) -> TimePushStatus {
        if !self.state.is_operational() {
            return TimePushStatus::MacIdle;
        }
        if !self.state.authority.can_push() || (mode == PushMode::Unicast && origin.is_none()) {
            debug!("time push rejected: {:?}", self.state.authority);
            return TimePushStatus::InvalidRequest;
        }

        let sync = &mut self.state.time_sync;
        if sync.in_queue || sync.in_diversity {
            return TimePushStatus::Pending;
        }
        if self.state.timers.is_running(TimerId::TimeSetBlocking) {
            debug!("time push inside blocking window, resend scheduled");
            sync.resend_pending = true;
            return TimePushStatus::Pending;
        }
        if diversity_ms > 0 {
            let now = self.clock.now();
            self.state.timers.start(
                TimerId::TimeDiversity,
                now,
                Duration::from_millis(u64::from(diversity_ms)),
            );
            sync.deferred = Some(PushTarget { mode, origin });
            sync.in_diversity = true;
            debug!("time push deferred by {}ms", diversity_ms);
            return TimePushStatus::Pending;
        }

        let tx_channels = self.phy.tx_channels();
        if channels::eligible_channels(
            &tx_channels,
            self.state.config.channel_sets(ChannelSets::Srfn),
            ChannelSetIndex::First,
        )
        .is_empty()
        {
            warn!("no channel for time set");
            return TimePushStatus::TransactionFailed;
        }

        let dst = match (mode, origin) {
            (PushMode::Unicast, Some(addr)) => Destination::Unicast(addr),
            _ => Destination::Broadcast,
        };
        let transaction = Transaction::command(CommandId::TimeSet, dst, commands::time_set());
        match self.frames.create(transaction, self.clock.now()) {
            Ok(_) => {
                let sync = &mut self.state.time_sync;
                sync.in_queue = true;
                sync.link_params_after = origin.is_some()
                    && mode == PushMode::Broadcast
                    && self.state.config.link_params_enabled();
                info!("time set queued ({:?})", dst);
                TimePushStatus::Success
            }
            Err(e) => {
                warn!("time set not queued: {}", e);
                MacCounters::incr(&self.state.counters.transaction_overflows);
                TimePushStatus::TransactionOverflow
            }
        }
    }

    /// The queued time set has completed, whatever the outcome.
    pub(crate) fn on_time_set_complete(&mut self) {
        let sync = &mut self.state.time_sync;
        sync.in_queue = false;
        if std::mem::take(&mut sync.link_params_after) {
            self.queue_link_params();
        }
        self.resend_time_set();
    }

    pub(crate) fn on_blocking_window_expired(&mut self) {
        self.resend_time_set();
    }

    pub(crate) fn on_time_diversity_expired(&mut self) {
        let sync = &mut self.state.time_sync;
        sync.in_diversity = false;
        if let Some(target) = sync.deferred.take() {
            let status = self.push_time(target.mode, target.origin, 0);
            debug!("deferred time push: {:?}", status);
        }
        self.resend_time_set();
    }

    /// Broadcast the time set requested inside a blocking window, once the
    /// window is closed and no other time set is pending.
    fn resend_time_set(&mut self) {
        let sync = &self.state.time_sync;
        if !sync.resend_pending || self.state.timers.is_running(TimerId::TimeSetBlocking) {
            return;
        }
        if sync.in_queue || sync.in_diversity {
            debug!("time set resend waits for the pending time set");
            return;
        }
        self.state.time_sync.resend_pending = false;
        let status = self.push_time(PushMode::Broadcast, None, 0);
        debug!("time set resend: {:?}", status);
    }

    /// A neighbour asked for the time.
    pub(crate) fn on_time_request(&mut self, src: MacAddress) {
        let status = match self.state.config.time_query_response_mode {
            TimeQueryResponseMode::Broadcast => {
                let max = u32::from(self.state.config.cmd_resp_max_time_diversity_ms);
                let diversity = self.rng.range_inclusive(0, max);
                self.push_time(PushMode::Broadcast, Some(src), diversity)
            }
            TimeQueryResponseMode::Unicast => self.push_time(PushMode::Unicast, Some(src), 0),
            TimeQueryResponseMode::Ignore => {
                debug!("time request from {:02x?} ignored", src);
                return;
            }
        };
        debug!("time request from {:02x?}: {:?}", src, status);
    }

    /// Queue a LINK_PARAM broadcast.
    pub(crate) fn queue_link_params(&mut self) {
        let payload = self.state.config.link_parameters.encode();
        let transaction =
            Transaction::command(CommandId::LinkParam, Destination::Broadcast, payload);
        if let Err(e) = self.frames.create(transaction, self.clock.now()) {
            warn!("link parameters not queued: {}", e);
            MacCounters::incr(&self.state.counters.transaction_overflows);
        }
    }
}
