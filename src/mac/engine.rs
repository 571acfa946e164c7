//! The MAC engine.
//!
//! [`Engine`] owns every piece of MAC state and is driven from one place:
//! upstream requests, transceiver confirmations, received frames and
//! [`Engine::poll`] for timers. Nothing here blocks except the short
//! backoff sleeps taken through the [`Clock`].
//!
//! # Example
//!
//! ```no_run
//! use srfn_mac::mac::{
//!     Confirmation, DataRequest, Destination, Engine, MacConfig, Request, RequestKind,
//!     RngSource, SystemClock, TxQueue,
//! };
//! # fn run(phy: impl srfn_mac::mac::Transceiver) -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = Engine::new(
//!     MacConfig::default(),
//!     phy,
//!     TxQueue::default(),
//!     SystemClock,
//!     RngSource::from_os()?,
//! )?;
//! engine.handle_request(Request { handle: 1, kind: RequestKind::Start });
//! let request = DataRequest::new(Destination::Broadcast, b"hello".to_vec());
//! engine.handle_request(Request { handle: 2, kind: RequestKind::Data(request) });
//! for confirmation in engine.poll() {
//!     println!("{:?}", confirmation);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::channels;
use super::commands::{self, Command, CommandId, NetTime, PingReq, PingRsp};
use super::config::{Attribute, AttributeValue, ConfigError, MacConfig};
use super::csma::{AccessState, ChannelAccess};
use super::frames::{Completion, FrameManager, Origin, Service, Transaction};
use super::phy::{self, ConfirmKind, PhyConfirm, RxIndication, Transceiver};
use super::primitives::{
    ChannelSets, Confirmation, DataRequest, DataStatus, Destination, FlushStatus, GetStatus,
    Handle, Indication, PingRequest, PurgeStatus, Request, RequestKind, ResetKind,
    ResetStatus, SetStatus, StartStatus, StopStatus, TimeQueryStatus, MAC_MAX_PAYLOAD,
    MAX_PRIORITY,
};
use super::random::RandomSource;
use super::supervisor::{ConfirmSupervisor, LivenessWatchdog, SyntheticConfirm};
use super::throttle::TxThrottle;
use super::time_sync::{TimeAuthority, TimeSync};
use super::timers::{Clock, TimerId, Timers};
use crate::stats::MacCounters;

/// Frames started per poll, bounding the work done when many fail at once.
const MAX_STARTS_PER_POLL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    Idle,
    Operational,
}

impl MacState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Operational => "operational",
        }
    }
}

/// Mutable MAC state, separate from the collaborators so borrows split.
pub(crate) struct EngineState {
    pub(crate) config: MacConfig,
    pub(crate) mac_state: MacState,
    pub(crate) access: ChannelAccess,
    pub(crate) throttle: TxThrottle,
    pub(crate) time_sync: TimeSync,
    pub(crate) supervisor: ConfirmSupervisor,
    pub(crate) watchdog: LivenessWatchdog,
    pub(crate) timers: Timers,
    pub(crate) counters: Arc<MacCounters>,
    pub(crate) tx_paused: bool,
    pub(crate) authority: TimeAuthority,
    pub(crate) ping_count: u16,
    /// Confirmations produced outside `poll`, delivered on the next one.
    pub(crate) deferred: Vec<Confirmation>,
    pub(crate) loopback: VecDeque<SyntheticConfirm>,
}

impl EngineState {
    pub(crate) fn is_operational(&self) -> bool {
        self.mac_state == MacState::Operational
    }
}

/// CSMA/CA MAC engine over injected collaborators.
pub struct Engine<P, F, C, R> {
    pub(crate) phy: P,
    pub(crate) frames: F,
    pub(crate) clock: C,
    pub(crate) rng: R,
    pub(crate) state: EngineState,
}

impl<P, F, C, R> Engine<P, F, C, R>
where
    P: Transceiver,
    F: FrameManager,
    C: Clock,
    R: RandomSource,
{
    /// Build an idle engine. Fails if `config` is out of range.
    pub fn new(config: MacConfig, phy: P, frames: F, clock: C, rng: R) -> Result<Self, ConfigError> {
        config.validate()?;
        let throttle = TxThrottle::new(config.throttle);
        let mut timers = Timers::new();
        timers.start(
            TimerId::ThrottleInterval,
            clock.now(),
            throttle.config().interval(),
        );

        Ok(Self {
            phy,
            frames,
            clock,
            rng,
            state: EngineState {
                config,
                mac_state: MacState::Idle,
                access: ChannelAccess::default(),
                throttle,
                time_sync: TimeSync::default(),
                supervisor: ConfirmSupervisor::new(),
                watchdog: LivenessWatchdog::default(),
                timers,
                counters: Arc::new(MacCounters::new()),
                tx_paused: false,
                authority: TimeAuthority::default(),
                ping_count: 0,
                deferred: Vec::new(),
                loopback: VecDeque::new(),
            },
        })
    }

    /// Process an upstream request. Returns its confirmation when it is
    /// known now; data, ping and time-query confirmations otherwise come
    /// from [`Engine::poll`] or [`Engine::handle_phy_confirm`].
    pub fn handle_request(&mut self, request: Request) -> Option<Confirmation> {
        let handle = request.handle;
        match request.kind {
            RequestKind::Data(req) => self.data_request(handle, req),
            RequestKind::Ping(req) => self.ping_request(handle, req),
            RequestKind::Get(attribute) => {
                let (status, value) = self.get(attribute);
                Some(Confirmation::Get {
                    handle,
                    status,
                    value,
                })
            }
            RequestKind::Set(attribute, value) => Some(Confirmation::Set {
                handle,
                status: self.set(attribute, value),
            }),
            RequestKind::Start => Some(Confirmation::Start {
                handle,
                status: self.start(),
            }),
            RequestKind::Stop => Some(Confirmation::Stop {
                handle,
                status: self.stop(),
            }),
            RequestKind::Reset(kind) => Some(Confirmation::Reset {
                handle,
                status: self.reset(kind),
            }),
            RequestKind::Flush => Some(Confirmation::Flush {
                handle,
                status: self.flush(),
            }),
            RequestKind::Purge(target) => Some(Confirmation::Purge {
                handle,
                status: self.purge(target),
            }),
            RequestKind::TimeQuery => self.time_query(handle),
        }
    }

    fn data_request(&mut self, handle: Handle, req: DataRequest) -> Option<Confirmation> {
        let status = if !self.state.is_operational() {
            Err(DataStatus::MacIdle)
        } else if req.payload.is_empty()
            || req.payload.len() > MAC_MAX_PAYLOAD
            || req.priority > MAX_PRIORITY
            || !self.has_channel(req.channel_sets, req.channel_set_index)
        {
            Err(DataStatus::InvalidParameter)
        } else {
            let transaction = Transaction {
                origin: Origin::Upstream {
                    handle,
                    service: Service::Data,
                },
                dst: req.dst,
                payload: req.payload,
                priority: req.priority,
                retries: self.state.config.retry_count(req.reliability),
                channel_sets: req.channel_sets,
                channel_set_index: req.channel_set_index,
                droppable: req.droppable,
                skip_cca: req.skip_cca,
            };
            self.enqueue(transaction)
        };
        status
            .err()
            .map(|status| Confirmation::Data { handle, status })
    }

    fn ping_request(&mut self, handle: Handle, req: PingRequest) -> Option<Confirmation> {
        let status = if !self.state.is_operational() {
            Err(DataStatus::MacIdle)
        } else if req.priority > MAX_PRIORITY
            || !self.has_channel(ChannelSets::Srfn, req.channel_set_index)
        {
            Err(DataStatus::InvalidParameter)
        } else {
            let payload = PingReq {
                handle,
                tx_time: NetTime::default(),
                counter_reset: req.counter_reset,
                unicast_response: req.unicast_response,
            }
            .encode();
            let transaction = Transaction {
                origin: Origin::Upstream {
                    handle,
                    service: Service::Ping,
                },
                dst: req.dst,
                payload,
                priority: req.priority,
                retries: self.state.config.retry_count(req.reliability),
                channel_sets: ChannelSets::Srfn,
                channel_set_index: req.channel_set_index,
                droppable: true,
                skip_cca: false,
            };
            self.enqueue(transaction)
        };
        status
            .err()
            .map(|status| Confirmation::Ping { handle, status })
    }

    fn time_query(&mut self, handle: Handle) -> Option<Confirmation> {
        if !self.state.is_operational() {
            return Some(Confirmation::TimeQuery {
                handle,
                status: TimeQueryStatus::MacIdle,
            });
        }
        let mut transaction = Transaction::command(
            CommandId::TimeReq,
            Destination::Broadcast,
            commands::time_req(),
        );
        transaction.origin = Origin::Upstream {
            handle,
            service: Service::TimeQuery,
        };
        self.enqueue(transaction)
            .err()
            .map(|_| Confirmation::TimeQuery {
                handle,
                status: TimeQueryStatus::TransactionOverflow,
            })
    }

    fn has_channel(&self, family: ChannelSets, index: super::primitives::ChannelSetIndex) -> bool {
        let tx_channels = self.phy.tx_channels();
        !channels::eligible_channels(&tx_channels, self.state.config.channel_sets(family), index)
            .is_empty()
    }

    fn enqueue(&mut self, transaction: Transaction) -> Result<(), DataStatus> {
        let now = self.clock.now();
        match self.frames.create(transaction, now) {
            Ok(id) => {
                debug!("queued frame {:?}", id);
                self.state.watchdog.arm(now);
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                MacCounters::incr(&self.state.counters.transaction_overflows);
                Err(DataStatus::TransactionOverflow)
            }
        }
    }

    fn get(&self, attribute: Attribute) -> (GetStatus, Option<AttributeValue>) {
        let counters = self.state.counters.snapshot();
        let value = match attribute {
            Attribute::State => Some(AttributeValue::Text(self.state.mac_state.name())),
            Attribute::ChannelAccessFailureCount => {
                Some(AttributeValue::U32(counters.channel_access_failures))
            }
            Attribute::TxFrameCount => Some(AttributeValue::U32(counters.tx_frames)),
            Attribute::TxLinkDelayCount => Some(AttributeValue::U32(counters.tx_link_delay_count)),
            Attribute::TxLinkDelayTimeMs => {
                Some(AttributeValue::U32(counters.tx_link_delay_time_ms))
            }
            Attribute::TransactionOverflowCount => {
                Some(AttributeValue::U32(counters.transaction_overflows))
            }
            Attribute::TransactionTimeoutCount => {
                Some(AttributeValue::U32(counters.transaction_timeouts))
            }
            Attribute::PingCount => Some(AttributeValue::U16(self.state.ping_count)),
            Attribute::ThrottleRemaining => {
                Some(AttributeValue::U32(self.state.throttle.remaining()))
            }
            other => self.state.config.get(other),
        };
        match value {
            Some(value) => (GetStatus::Success, Some(value)),
            None => (GetStatus::Unsupported, None),
        }
    }

    fn set(&mut self, attribute: Attribute, value: AttributeValue) -> SetStatus {
        if self.state.supervisor.pending() == Some(ConfirmKind::Reset) {
            return SetStatus::ServiceUnavailable;
        }
        let status = self.state.config.set(attribute, value);
        if status == SetStatus::Success {
            info!("MAC attribute {} updated", attribute);
            if matches!(
                attribute,
                Attribute::LinkParamsPeriodS
                    | Attribute::LinkParamsMaxOffsetMs
                    | Attribute::LinkParamsStartS
            ) {
                self.schedule_link_params();
            }
        }
        status
    }

    fn start(&mut self) -> StartStatus {
        if self.state.is_operational() {
            return StartStatus::Running;
        }
        self.state.mac_state = MacState::Operational;
        self.schedule_link_params();
        info!("MAC started");
        StartStatus::Success
    }

    fn stop(&mut self) -> StopStatus {
        if !self.state.is_operational() {
            return StopStatus::Error;
        }
        self.state.mac_state = MacState::Idle;
        self.state.timers.cancel(TimerId::LinkParams);
        info!("MAC stopped");
        StopStatus::Success
    }

    fn reset(&mut self, kind: ResetKind) -> ResetStatus {
        if kind == ResetKind::All {
            // The throttle window outlives resets; only an override clears it.
            let gateway = self.state.config.gateway;
            let throttle = self.state.config.throttle;
            self.state.config = MacConfig {
                gateway,
                throttle,
                ..MacConfig::default()
            };
            self.schedule_link_params();
            info!("MAC configuration restored to defaults");
        }
        self.state.counters.reset();
        self.state.ping_count = 0;
        ResetStatus::Success
    }

    fn flush(&mut self) -> FlushStatus {
        if !self.state.is_operational() {
            return FlushStatus::MacIdle;
        }
        let flushed = self.frames.flush();
        debug!("flushed {} transactions", flushed.len());
        for completion in flushed {
            if let Some(confirmation) = self.finish(completion) {
                self.state.deferred.push(confirmation);
            }
        }
        FlushStatus::Success
    }

    fn purge(&mut self, handle: Handle) -> PurgeStatus {
        if !self.state.is_operational() {
            return PurgeStatus::Idle;
        }
        match self.frames.purge(handle) {
            Some(completion) => {
                if let Some(confirmation) = self.finish(completion) {
                    self.state.deferred.push(confirmation);
                }
                PurgeStatus::Success
            }
            None => PurgeStatus::InvalidHandle,
        }
    }

    /// (Re)arm the periodic link-parameter timer, or cancel it when
    /// link-parameter broadcasts are off.
    fn schedule_link_params(&mut self) {
        let config = &self.state.config;
        if !(self.state.is_operational() && config.link_params_enabled()) {
            self.state.timers.cancel(TimerId::LinkParams);
            return;
        }
        let offset = self.rng.range_inclusive(0, config.link_params_max_offset_ms);
        let after = Duration::from_secs(u64::from(config.link_params_period_s))
            + Duration::from_millis(u64::from(offset));
        let now = self.clock.now();
        self.state.timers.start(TimerId::LinkParams, now, after);
        debug!("next link parameters in {:?}", after);
    }

    /// Process a transceiver confirmation.
    pub fn handle_phy_confirm(&mut self, confirm: PhyConfirm) -> Option<Confirmation> {
        self.state.watchdog.feed();
        if !self.state.supervisor.on_confirm(confirm.kind()) {
            return None;
        }
        self.route_confirm(confirm)
    }

    /// Process a synthetic confirmation taken from [`Engine::take_synthetic`].
    /// A stale or duplicate one is dropped.
    pub fn handle_synthetic(&mut self, synthetic: SyntheticConfirm) -> Option<Confirmation> {
        if !self.state.supervisor.on_synthetic(&synthetic) {
            return None;
        }
        MacCounters::incr(&self.state.counters.synthetic_confirms);
        self.route_confirm(synthetic.confirm)
    }

    fn route_confirm(&mut self, confirm: PhyConfirm) -> Option<Confirmation> {
        match confirm {
            PhyConfirm::Cca { status, clear } => self.on_cca_confirm(status, clear),
            PhyConfirm::Data { status, delay_ms } => self.on_data_confirm(status, delay_ms),
            PhyConfirm::Reset { status } => {
                match status {
                    phy::ResetStatus::Success => info!("transceiver reset complete"),
                    phy::ResetStatus::Failure => error!("transceiver reset failed"),
                }
                None
            }
        }
    }

    /// Process a received frame. Data frames and the commands meant for the
    /// upper layers come back as indications.
    pub fn handle_indication(&mut self, rx: RxIndication) -> Option<Indication> {
        MacCounters::incr(&self.state.counters.rx_frames);
        if !rx.is_command {
            return Some(Indication::Data {
                src: rx.src,
                payload: rx.payload,
                rssi_dbm: rx.rssi_dbm,
            });
        }

        match commands::parse(&rx.payload) {
            Ok(Command::TimeSet(payload)) => Some(Indication::TimeSet {
                src: rx.src,
                payload,
            }),
            Ok(Command::TimeReq) => {
                self.on_time_request(rx.src);
                None
            }
            Ok(Command::PingReq(req)) => {
                self.on_ping_request(&rx, req);
                None
            }
            Ok(Command::PingRsp(response)) => Some(Indication::PingResponse {
                src: rx.src,
                response,
            }),
            Ok(Command::LinkParam(params)) => Some(Indication::LinkParameters {
                src: rx.src,
                params,
            }),
            Err(e) => {
                warn!("malformed command from {:02x?}: {}", rx.src, e);
                MacCounters::incr(&self.state.counters.malformed_commands);
                None
            }
        }
    }

    fn on_ping_request(&mut self, rx: &RxIndication, req: PingReq) {
        if !self.state.is_operational() {
            return;
        }
        if req.counter_reset {
            self.state.ping_count = 0;
        }
        self.state.ping_count = self.state.ping_count.wrapping_add(1);

        let response = PingRsp {
            handle: req.handle,
            origin: rx.src,
            req_tx_time: req.tx_time,
            counter_reset: req.counter_reset,
            unicast_response: req.unicast_response,
            req_rx_time: rx.rx_time,
            rsp_tx_time: NetTime::default(),
            ping_count: self.state.ping_count,
            req_rssi: commands::scale_rssi(rx.rssi_dbm),
            req_channel: rx.channel,
        };
        let dst = if req.unicast_response {
            Destination::Unicast(rx.src)
        } else {
            Destination::Broadcast
        };
        let transaction = Transaction::command(CommandId::PingRsp, dst, response.encode());
        if self.enqueue(transaction).is_err() {
            warn!("ping response to {:02x?} dropped", rx.src);
        }
    }

    /// Map a finished transaction to the confirmation its requester waits on.
    pub(crate) fn finish(&mut self, completion: Completion) -> Option<Confirmation> {
        let status = completion.status;
        if status != DataStatus::Success {
            MacCounters::incr(&self.state.counters.tx_failed);
        }
        match completion.origin {
            Origin::Upstream {
                handle,
                service: Service::Data,
            } => Some(Confirmation::Data { handle, status }),
            Origin::Upstream {
                handle,
                service: Service::Ping,
            } => Some(Confirmation::Ping { handle, status }),
            Origin::Upstream {
                handle,
                service: Service::TimeQuery,
            } => Some(Confirmation::TimeQuery {
                handle,
                status: match status {
                    DataStatus::Success => TimeQueryStatus::Success,
                    _ => TimeQueryStatus::TransactionFailed,
                },
            }),
            Origin::Command(CommandId::TimeSet) => {
                debug!("time set finished: {:?}", status);
                self.on_time_set_complete();
                None
            }
            Origin::Command(command) => {
                debug!("{:?} command finished: {:?}", command, status);
                None
            }
        }
    }

    /// Run timers, timeouts and the transmit queue. Returns the
    /// confirmations that became ready.
    pub fn poll(&mut self) -> Vec<Confirmation> {
        let mut out = std::mem::take(&mut self.state.deferred);
        let now = self.clock.now();

        for timer in self.state.timers.take_expired(now) {
            match timer {
                TimerId::CcaDelay => out.extend(self.on_cca_delay_expired()),
                TimerId::TimeSetBlocking => self.on_blocking_window_expired(),
                TimerId::TimeDiversity => self.on_time_diversity_expired(),
                TimerId::ThrottleInterval => {
                    self.state.throttle.on_interval_rollover();
                    let interval = self.state.throttle.config().interval();
                    self.state
                        .timers
                        .start(TimerId::ThrottleInterval, now, interval);
                }
                TimerId::LinkParams => {
                    if self.state.config.link_params_enabled() && self.state.is_operational() {
                        self.queue_link_params();
                    }
                    self.schedule_link_params();
                }
                TimerId::TxPacketDelay => debug!("transmit gap elapsed"),
            }
        }

        let timeout = Duration::from_secs(u64::from(self.state.config.transaction_timeout_s));
        for completion in self.frames.check_timeouts(now, timeout) {
            warn!("transaction timed out: {:?}", completion.origin);
            MacCounters::incr(&self.state.counters.transaction_timeouts);
            out.extend(self.finish(completion));
        }

        if self.frames.is_empty() {
            self.state.watchdog.feed();
        } else {
            self.state.watchdog.arm(now);
        }
        if self.state.watchdog.expired(now) {
            out.extend(self.restart_phy(now));
        }

        if let Some(synthetic) = self.state.supervisor.check(now) {
            self.state.loopback.push_back(synthetic);
        }

        for _ in 0..MAX_STARTS_PER_POLL {
            if !self.can_start_frame() || !self.frames.has_ready() {
                break;
            }
            out.extend(self.start_next_frame());
        }
        out.append(&mut self.state.deferred);

        MacCounters::set(
            &self.state.counters.throttle_remaining,
            self.state.throttle.remaining(),
        );
        MacCounters::set(&self.state.counters.queue_depth, self.frames.len() as u32);
        out
    }

    /// The transceiver has been silent too long: drop the attempt in
    /// progress and reset it.
    fn restart_phy(&mut self, now: Instant) -> Option<Confirmation> {
        error!("transceiver unresponsive, resetting");
        MacCounters::incr(&self.state.counters.phy_restarts);
        self.state.supervisor.clear();
        self.state.loopback.clear();
        let failed = self.fail_current();
        match self.phy.reset_request() {
            Ok(()) => self.state.supervisor.arm(ConfirmKind::Reset, now),
            Err(e) => error!("transceiver reset refused: {}", e),
        }
        failed
    }

    /// Next synthetic confirmation to feed back through
    /// [`Engine::handle_synthetic`].
    pub fn take_synthetic(&mut self) -> Option<SyntheticConfirm> {
        self.state.loopback.pop_front()
    }

    /// Earliest instant at which [`Engine::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.state.timers.next_deadline(),
            self.state.supervisor.deadline(),
            self.state.watchdog.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Hold back new transmissions. The attempt in progress finishes.
    pub fn pause_tx(&mut self, paused: bool) {
        info!("transmission {}", if paused { "paused" } else { "resumed" });
        self.state.tx_paused = paused;
    }

    /// Force a throttle budget in bytes. Zero restores the full capacity.
    pub fn set_tx_throttle(&mut self, budget: u32) {
        self.state.throttle.set_override(budget);
    }

    /// Stop throttling for `hours`, then resume normal intervals. Zero
    /// resumes at once.
    pub fn suspend_throttle(&mut self, hours: u8) {
        let now = self.clock.now();
        if hours == 0 {
            self.state.throttle.enable();
            let interval = self.state.throttle.config().interval();
            self.state
                .timers
                .start(TimerId::ThrottleInterval, now, interval);
            return;
        }
        info!("throttle suspended for {}h", hours);
        self.state.throttle.disable();
        self.state.timers.start(
            TimerId::ThrottleInterval,
            now,
            Duration::from_secs(u64::from(hours) * 3600),
        );
    }

    pub fn set_time_authority(&mut self, authority: TimeAuthority) {
        self.state.authority = authority;
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn config(&self) -> &MacConfig {
        &self.state.config
    }

    pub fn counters(&self) -> Arc<MacCounters> {
        Arc::clone(&self.state.counters)
    }

    pub fn mac_state(&self) -> MacState {
        self.state.mac_state
    }

    pub fn access_state(&self) -> AccessState {
        self.state.access.state
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.state.time_sync
    }

    /// PING_REQ frames counted since the last counter reset.
    pub fn ping_count(&self) -> u16 {
        self.state.ping_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::config::TimeQueryResponseMode;
    use crate::mac::frames::TxQueue;
    use crate::mac::phy::{CcaStatus, Framing, PhyDataStatus, TxConstraint};
    use crate::mac::primitives::{ChannelSetIndex, MacAddress, TimePushStatus};
    use crate::mac::random::RngSource;
    use crate::mac::time_sync::{PushMode, TimeRole};
    use crate::testing::{ManualClock, RecordingPhy, ScriptedRandom};

    type TestEngine = Engine<RecordingPhy, TxQueue, ManualClock, ScriptedRandom>;

    const PEER: MacAddress = [1, 2, 3, 4, 5];

    fn started(config: MacConfig) -> (TestEngine, ManualClock) {
        let clock = ManualClock::new();
        let mut engine = Engine::new(
            config,
            RecordingPhy::new(vec![2700, 1000]),
            TxQueue::default(),
            clock.clone(),
            ScriptedRandom::default(),
        )
        .unwrap();
        assert_eq!(
            engine.handle_request(Request {
                handle: 0,
                kind: RequestKind::Start
            }),
            Some(Confirmation::Start {
                handle: 0,
                status: StartStatus::Success
            })
        );
        (engine, clock)
    }

    fn data(handle: Handle) -> Request {
        Request {
            handle,
            kind: RequestKind::Data(DataRequest::new(Destination::Broadcast, vec![1, 2, 3])),
        }
    }

    fn cca(clear: bool) -> PhyConfirm {
        PhyConfirm::Cca {
            status: CcaStatus::Success,
            clear,
        }
    }

    fn sent_ok() -> PhyConfirm {
        PhyConfirm::Data {
            status: PhyDataStatus::Success,
            delay_ms: 0,
        }
    }

    fn source(engine: &mut TestEngine) {
        engine.set_time_authority(TimeAuthority {
            role: TimeRole::Source,
            time_valid: true,
        });
    }

    fn rx_command(payload: Vec<u8>) -> RxIndication {
        RxIndication {
            src: PEER,
            is_command: true,
            payload,
            rssi_dbm: -80,
            channel: 2700,
            rx_time: NetTime::new(100, 0),
        }
    }

    #[test]
    fn test_idle_request_gets_one_confirmation() {
        let clock = ManualClock::new();
        let mut engine = Engine::new(
            MacConfig::default(),
            RecordingPhy::new(vec![2700]),
            TxQueue::default(),
            clock,
            ScriptedRandom::default(),
        )
        .unwrap();
        assert_eq!(
            engine.handle_request(data(1)),
            Some(Confirmation::Data {
                handle: 1,
                status: DataStatus::MacIdle
            })
        );
        assert!(engine.poll().is_empty());
        assert!(engine.frames().is_empty());
    }

    #[test]
    fn test_invalid_payload_rejected() {
        let (mut engine, _) = started(MacConfig::default());
        let mut req = DataRequest::new(Destination::Broadcast, Vec::new());
        assert_eq!(
            engine.handle_request(Request {
                handle: 3,
                kind: RequestKind::Data(req.clone())
            }),
            Some(Confirmation::Data {
                handle: 3,
                status: DataStatus::InvalidParameter
            })
        );
        req.payload = vec![0; MAC_MAX_PAYLOAD + 1];
        assert!(engine
            .handle_request(Request {
                handle: 4,
                kind: RequestKind::Data(req)
            })
            .is_some());
    }

    #[test]
    fn test_always_busy_fails_after_max_attempts() {
        let mut config = MacConfig::default();
        config.csma_max_attempts = 3;
        let (mut engine, _) = started(config);

        assert_eq!(engine.handle_request(data(1)), None);
        assert!(engine.poll().is_empty());
        assert_eq!(engine.phy().cca_requests.len(), 1);

        for _ in 0..3 {
            assert_eq!(engine.handle_phy_confirm(cca(false)), None);
        }
        assert_eq!(engine.phy().cca_requests.len(), 4);
        assert_eq!(
            engine.handle_phy_confirm(cca(false)),
            Some(Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            })
        );
        assert_eq!(engine.phy().cca_requests.len(), 4);
        assert!(engine.phy().sent.is_empty());
        assert_eq!(engine.counters().snapshot().channel_access_failures, 1);
        assert_eq!(engine.access_state(), AccessState::PhyReady);
    }

    #[test]
    fn test_p_one_transmits_on_first_clear() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);

        engine.handle_request(data(7));
        engine.poll();
        assert_eq!(engine.handle_phy_confirm(cca(true)), None);
        assert_eq!(engine.access_state(), AccessState::Transmitting);

        let frame = &engine.phy().sent[0];
        assert_eq!(frame.channel, 2700);
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert!(!frame.is_command);
        assert_eq!(frame.constraint, TxConstraint::Regular);

        assert_eq!(
            engine.handle_phy_confirm(sent_ok()),
            Some(Confirmation::Data {
                handle: 7,
                status: DataStatus::Success
            })
        );
        assert_eq!(engine.counters().snapshot().tx_frames, 1);
        assert!(engine.frames().is_empty());
    }

    #[test]
    fn test_p_zero_never_transmits_without_quick_abort() {
        let mut config = MacConfig::default();
        config.csma_p_value = 0.0;
        let (mut engine, _) = started(config);
        engine.rng.units.extend(std::iter::repeat(0.5).take(50));

        engine.handle_request(data(1));
        engine.poll();
        for _ in 0..50 {
            assert_eq!(engine.handle_phy_confirm(cca(true)), None);
        }
        assert!(engine.phy().sent.is_empty());
        assert_eq!(engine.phy().cca_requests.len(), 51);
        assert_eq!(engine.counters().snapshot().channel_access_failures, 0);

        // Flush leaves the frame in channel access alone
        assert_eq!(
            engine.handle_request(Request {
                handle: 2,
                kind: RequestKind::Flush
            }),
            Some(Confirmation::Flush {
                handle: 2,
                status: FlushStatus::Success
            })
        );
        assert_eq!(engine.frames().len(), 1);
    }

    #[test]
    fn test_quick_abort_fails_on_declined_draw() {
        let mut config = MacConfig::default();
        config.csma_p_value = 0.0;
        config.csma_quick_abort = true;
        let (mut engine, _) = started(config);
        engine.rng.units.push_back(0.5);

        engine.handle_request(data(1));
        engine.poll();
        assert_eq!(
            engine.handle_phy_confirm(cca(true)),
            Some(Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            })
        );
        assert_eq!(engine.phy().cca_requests.len(), 1);
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let mut config = MacConfig::default();
        config.csma_max_attempts = 20;
        let clock = ManualClock::new();
        let mut engine = Engine::new(
            config,
            RecordingPhy::new(vec![2700]),
            TxQueue::default(),
            clock.clone(),
            RngSource::seeded(7),
        )
        .unwrap();
        engine.handle_request(Request {
            handle: 0,
            kind: RequestKind::Start,
        });
        engine.handle_request(data(1));
        engine.poll();
        for _ in 0..20 {
            assert_eq!(
                engine.handle_phy_confirm(PhyConfirm::Cca {
                    status: CcaStatus::Success,
                    clear: false
                }),
                None
            );
        }

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 20);
        for sleep in sleeps {
            assert!(sleep >= Duration::from_millis(30) && sleep <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_long_backoff_uses_timer() {
        let mut config = MacConfig::default();
        config.csma_min_backoff_ms = 100;
        config.csma_max_backoff_ms = 500;
        let (mut engine, clock) = started(config);
        engine.rng.ranges.push_back(500);

        engine.handle_request(data(1));
        engine.poll();
        assert_eq!(engine.handle_phy_confirm(cca(false)), None);
        assert_eq!(engine.access_state(), AccessState::CcaDelay);
        assert_eq!(engine.phy().cca_requests.len(), 1);

        clock.advance(Duration::from_millis(499));
        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 1);
        clock.advance(Duration::from_millis(1));
        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 2);
        assert_eq!(engine.access_state(), AccessState::CcaPending);
    }

    #[test]
    fn test_refused_requests_fail_frame() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);

        engine.phy.refuse_cca = true;
        engine.handle_request(data(1));
        assert_eq!(
            engine.poll(),
            vec![Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            }]
        );

        engine.phy.refuse_cca = false;
        engine.phy.refuse_data = true;
        engine.handle_request(data(2));
        assert!(engine.poll().is_empty());
        assert_eq!(
            engine.handle_phy_confirm(cca(true)),
            Some(Confirmation::Data {
                handle: 2,
                status: DataStatus::TransactionFailed
            })
        );
        assert_eq!(engine.access_state(), AccessState::PhyReady);
        assert!(engine.frames().is_empty());
    }

    #[test]
    fn test_throttle_exhaustion_fails_without_cca() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        engine.set_tx_throttle(1);

        engine.handle_request(data(1));
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        assert!(engine.handle_phy_confirm(sent_ok()).is_some());

        engine.handle_request(data(2));
        assert_eq!(
            engine.poll(),
            vec![Confirmation::Data {
                handle: 2,
                status: DataStatus::TransactionFailed
            }]
        );
        assert_eq!(engine.phy().cca_requests.len(), 1);
    }

    #[test]
    fn test_star_skip_cca_transmits_directly() {
        let (mut engine, _) = started(MacConfig::default());
        let mut req = DataRequest::new(Destination::Unicast(PEER), vec![9; 4]);
        req.channel_sets = ChannelSets::Star;
        req.skip_cca = true;
        engine.handle_request(Request {
            handle: 5,
            kind: RequestKind::Data(req),
        });
        engine.poll();

        assert!(engine.phy().cca_requests.is_empty());
        assert_eq!(engine.phy().sent[0].framing, Framing::Star);
        assert_eq!(engine.phy().sent[0].dst, Destination::Unicast(PEER));
    }

    #[test]
    fn test_star_busy_retries_then_transmits() {
        let mut config = MacConfig::default();
        config.csma_max_attempts = 2;
        let (mut engine, clock) = started(config);
        let mut req = DataRequest::new(Destination::Broadcast, vec![9; 4]);
        req.channel_sets = ChannelSets::Star;
        engine.handle_request(Request {
            handle: 5,
            kind: RequestKind::Data(req),
        });
        engine.poll();

        engine.handle_phy_confirm(cca(false));
        engine.handle_phy_confirm(cca(false));
        assert!(engine.phy().sent.is_empty());
        engine.handle_phy_confirm(cca(false));
        assert_eq!(engine.phy().sent.len(), 1);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(50), Duration::from_millis(50)]
        );
    }

    #[test]
    fn test_busy_transmitter_requeues_frame() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, clock) = started(config);

        engine.handle_request(data(1));
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        assert_eq!(
            engine.handle_phy_confirm(PhyConfirm::Data {
                status: PhyDataStatus::ThermalOverride,
                delay_ms: 200
            }),
            None
        );
        assert!(clock.sleeps().contains(&Duration::from_millis(200)));
        let snap = engine.counters().snapshot();
        assert_eq!(snap.tx_link_delay_count, 1);
        assert_eq!(snap.tx_link_delay_time_ms, 200);

        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 2);
        engine.handle_phy_confirm(cca(true));
        assert_eq!(
            engine.handle_phy_confirm(sent_ok()),
            Some(Confirmation::Data {
                handle: 1,
                status: DataStatus::Success
            })
        );
    }

    #[test]
    fn test_reliability_repeats_frame() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        let mut req = DataRequest::new(Destination::Broadcast, vec![1]);
        req.reliability = crate::mac::reliability::Reliability::High;
        engine.handle_request(Request {
            handle: 1,
            kind: RequestKind::Data(req),
        });

        let mut confirmations = Vec::new();
        for _ in 0..3 {
            engine.poll();
            engine.handle_phy_confirm(cca(true));
            confirmations.extend(engine.handle_phy_confirm(sent_ok()));
        }
        assert_eq!(engine.phy().sent.len(), 3);
        assert_eq!(
            confirmations,
            vec![Confirmation::Data {
                handle: 1,
                status: DataStatus::Success
            }]
        );
    }

    #[test]
    fn test_tx_packet_delay_spaces_frames() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        config.gateway = true;
        config.tx_packet_delay_ms = 300;
        let (mut engine, clock) = started(config);

        engine.handle_request(data(1));
        engine.handle_request(data(2));
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        engine.handle_phy_confirm(sent_ok());

        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 1);
        clock.advance(Duration::from_millis(300));
        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 2);
    }

    #[test]
    fn test_paused_tx_holds_queue() {
        let (mut engine, _) = started(MacConfig::default());
        engine.pause_tx(true);
        engine.handle_request(data(1));
        engine.poll();
        assert!(engine.phy().cca_requests.is_empty());
        engine.pause_tx(false);
        engine.poll();
        assert_eq!(engine.phy().cca_requests.len(), 1);
    }

    #[test]
    fn test_duplicate_synthetic_reported_once() {
        let (mut engine, clock) = started(MacConfig::default());
        engine.handle_request(data(1));
        engine.poll();

        clock.advance(Duration::from_millis(500));
        engine.poll();
        let synthetic = engine.take_synthetic().unwrap();
        assert_eq!(engine.take_synthetic(), None);

        assert_eq!(engine.handle_synthetic(synthetic), None);
        assert_eq!(engine.phy().cca_requests.len(), 2);
        assert_eq!(engine.handle_synthetic(synthetic), None);
        assert_eq!(engine.phy().cca_requests.len(), 2);
        assert_eq!(engine.counters().snapshot().synthetic_confirms, 1);
    }

    #[test]
    fn test_late_real_confirm_after_synthetic_dropped() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, clock) = started(config);
        engine.handle_request(data(1));
        engine.poll();
        engine.handle_phy_confirm(cca(true));

        clock.advance(Duration::from_millis(5000));
        engine.poll();
        let synthetic = engine.take_synthetic().unwrap();
        assert_eq!(
            engine.handle_synthetic(synthetic),
            Some(Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            })
        );
        assert_eq!(engine.handle_phy_confirm(sent_ok()), None);
        assert_eq!(engine.counters().snapshot().tx_frames, 0);
    }

    #[test]
    fn test_watchdog_resets_silent_transceiver() {
        let (mut engine, clock) = started(MacConfig::default());
        engine.handle_request(data(1));
        engine.poll();

        clock.advance(Duration::from_secs(601));
        let out = engine.poll();
        assert_eq!(
            out,
            vec![Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            }]
        );
        assert_eq!(engine.phy().resets, 1);
        assert_eq!(engine.counters().snapshot().phy_restarts, 1);
        assert_eq!(engine.access_state(), AccessState::PhyReady);

        assert_eq!(
            engine.handle_request(Request {
                handle: 2,
                kind: RequestKind::Set(Attribute::CsmaMaxAttempts, AttributeValue::U8(4))
            }),
            Some(Confirmation::Set {
                handle: 2,
                status: SetStatus::ServiceUnavailable
            })
        );
        assert_eq!(
            engine.handle_phy_confirm(PhyConfirm::Reset {
                status: phy::ResetStatus::Success
            }),
            None
        );
        assert_eq!(
            engine.handle_request(Request {
                handle: 3,
                kind: RequestKind::Set(Attribute::CsmaMaxAttempts, AttributeValue::U8(4))
            }),
            Some(Confirmation::Set {
                handle: 3,
                status: SetStatus::Success
            })
        );
    }

    #[test]
    fn test_transaction_timeout() {
        let (mut engine, clock) = started(MacConfig::default());
        engine.pause_tx(true);
        engine.handle_request(data(1));
        clock.advance(Duration::from_secs(61));
        assert_eq!(
            engine.poll(),
            vec![Confirmation::Data {
                handle: 1,
                status: DataStatus::TransactionFailed
            }]
        );
        assert_eq!(engine.counters().snapshot().transaction_timeouts, 1);
    }

    #[test]
    fn test_overflow() {
        let (mut engine, _) = started(MacConfig::default());
        engine.pause_tx(true);
        for handle in 0..10 {
            assert_eq!(engine.handle_request(data(handle)), None);
        }
        assert_eq!(
            engine.handle_request(data(10)),
            Some(Confirmation::Data {
                handle: 10,
                status: DataStatus::TransactionOverflow
            })
        );
        assert_eq!(engine.counters().snapshot().transaction_overflows, 1);
    }

    #[test]
    fn test_time_push_single_in_queue() {
        let (mut engine, _) = started(MacConfig::default());
        assert_eq!(
            engine.push_time(PushMode::Broadcast, None, 0),
            TimePushStatus::InvalidRequest
        );
        source(&mut engine);
        assert_eq!(
            engine.push_time(PushMode::Unicast, None, 0),
            TimePushStatus::InvalidRequest
        );
        assert_eq!(
            engine.push_time(PushMode::Broadcast, None, 0),
            TimePushStatus::Success
        );
        assert_eq!(
            engine.push_time(PushMode::Broadcast, None, 0),
            TimePushStatus::Pending
        );
        assert_eq!(engine.frames().len(), 1);
    }

    #[test]
    fn test_time_push_inside_blocking_window_resends() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, clock) = started(config);
        source(&mut engine);

        assert_eq!(
            engine.push_time(PushMode::Broadcast, None, 0),
            TimePushStatus::Success
        );
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        let frame = &engine.phy().sent[0];
        assert_eq!(frame.constraint, TxConstraint::Exact);
        assert_eq!(frame.payload[0], CommandId::TimeSet as u8);
        assert!(frame.is_command);
        assert_eq!(engine.handle_phy_confirm(sent_ok()), None);
        assert!(!engine.time_sync().in_queue());

        assert_eq!(
            engine.push_time(PushMode::Broadcast, None, 0),
            TimePushStatus::Pending
        );
        assert!(engine.time_sync().resend_pending());
        assert!(engine.frames().is_empty());

        clock.advance(Duration::from_millis(5000));
        engine.poll();
        assert!(engine.time_sync().in_queue());
        assert_eq!(engine.phy().cca_requests.len(), 2);
    }

    #[test]
    fn test_time_request_unicast_reply() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        config.time_query_response_mode = TimeQueryResponseMode::Unicast;
        let (mut engine, _) = started(config);
        source(&mut engine);

        assert_eq!(engine.handle_indication(rx_command(commands::time_req())), None);
        engine.poll();
        assert_eq!(engine.phy().cca_requests, vec![2700]);
        engine.handle_phy_confirm(cca(true));
        assert_eq!(engine.phy().sent[0].dst, Destination::Unicast(PEER));
    }

    #[test]
    fn test_time_request_broadcast_waits_for_diversity() {
        let (mut engine, clock) = started(MacConfig::default());
        source(&mut engine);
        engine.rng.ranges.push_back(400);

        engine.handle_indication(rx_command(commands::time_req()));
        engine.poll();
        assert!(engine.frames().is_empty());
        clock.advance(Duration::from_millis(400));
        engine.poll();
        assert_eq!(engine.frames().len(), 1);
    }

    #[test]
    fn test_time_request_ignored() {
        let mut config = MacConfig::default();
        config.time_query_response_mode = TimeQueryResponseMode::Ignore;
        let (mut engine, _) = started(config);
        source(&mut engine);
        engine.handle_indication(rx_command(commands::time_req()));
        engine.poll();
        assert!(engine.frames().is_empty());
    }

    #[test]
    fn test_gateway_time_answer_followed_by_link_params() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        config.gateway = true;
        let (mut engine, _) = started(config);
        source(&mut engine);
        assert_eq!(
            engine.push_time(PushMode::Broadcast, Some(PEER), 0),
            TimePushStatus::Success
        );
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        engine.handle_phy_confirm(sent_ok());

        assert_eq!(engine.frames().len(), 1);
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        assert_eq!(engine.phy().sent[1].payload[0], CommandId::LinkParam as u8);
    }

    #[test]
    fn test_ping_request_answered() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        let req = PingReq {
            handle: 9,
            tx_time: NetTime::new(50, 0),
            counter_reset: false,
            unicast_response: true,
        };
        assert_eq!(engine.handle_indication(rx_command(req.encode())), None);
        assert_eq!(engine.ping_count(), 1);

        engine.poll();
        engine.handle_phy_confirm(cca(true));
        let frame = engine.phy().sent[0].clone();
        assert_eq!(frame.dst, Destination::Unicast(PEER));
        match commands::parse(&frame.payload).unwrap() {
            Command::PingRsp(rsp) => {
                assert_eq!(rsp.handle, 9);
                assert_eq!(rsp.origin, PEER);
                assert_eq!(rsp.ping_count, 1);
                assert_eq!(rsp.req_channel, 2700);
                assert_eq!(rsp.req_rssi, commands::scale_rssi(-80));
                assert_eq!(rsp.req_rx_time, NetTime::new(100, 0));
            }
            other => panic!("expected ping response, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_counter_reset() {
        let (mut engine, _) = started(MacConfig::default());
        let mut req = PingReq {
            handle: 1,
            tx_time: NetTime::default(),
            counter_reset: false,
            unicast_response: false,
        };
        engine.handle_indication(rx_command(req.encode()));
        engine.handle_indication(rx_command(req.encode()));
        assert_eq!(engine.ping_count(), 2);
        req.counter_reset = true;
        engine.handle_indication(rx_command(req.encode()));
        assert_eq!(engine.ping_count(), 1);
    }

    #[test]
    fn test_ping_request_confirmed() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        let req = PingRequest {
            dst: Destination::Unicast(PEER),
            priority: 3,
            reliability: Default::default(),
            channel_set_index: ChannelSetIndex::Any,
            counter_reset: true,
            unicast_response: false,
        };
        assert_eq!(
            engine.handle_request(Request {
                handle: 11,
                kind: RequestKind::Ping(req)
            }),
            None
        );
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        assert!(engine.phy().sent[0].is_command);
        assert_eq!(
            engine.handle_phy_confirm(sent_ok()),
            Some(Confirmation::Ping {
                handle: 11,
                status: DataStatus::Success
            })
        );
    }

    #[test]
    fn test_indications() {
        let (mut engine, _) = started(MacConfig::default());
        let data = RxIndication {
            is_command: false,
            payload: vec![0xAB],
            ..rx_command(Vec::new())
        };
        assert_eq!(
            engine.handle_indication(data),
            Some(Indication::Data {
                src: PEER,
                payload: vec![0xAB],
                rssi_dbm: -80
            })
        );
        assert!(matches!(
            engine.handle_indication(rx_command(commands::time_set())),
            Some(Indication::TimeSet { src: PEER, .. })
        ));
        let params = commands::LinkParameters::default();
        assert_eq!(
            engine.handle_indication(rx_command(params.encode())),
            Some(Indication::LinkParameters { src: PEER, params })
        );
        assert_eq!(engine.handle_indication(rx_command(vec![0xEE])), None);
        assert_eq!(engine.handle_indication(rx_command(vec![2, 0])), None);
        let snap = engine.counters().snapshot();
        assert_eq!(snap.malformed_commands, 2);
        assert_eq!(snap.rx_frames, 5);
    }

    #[test]
    fn test_time_query_confirmed_on_completion() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        assert_eq!(
            engine.handle_request(Request {
                handle: 4,
                kind: RequestKind::TimeQuery
            }),
            None
        );
        engine.poll();
        engine.handle_phy_confirm(cca(true));
        assert_eq!(engine.phy().sent[0].payload, commands::time_req());
        assert_eq!(
            engine.handle_phy_confirm(sent_ok()),
            Some(Confirmation::TimeQuery {
                handle: 4,
                status: TimeQueryStatus::Success
            })
        );
    }

    #[test]
    fn test_flush_and_purge() {
        let (mut engine, _) = started(MacConfig::default());
        for handle in 1..=3 {
            engine.handle_request(data(handle));
        }
        engine.poll();

        let purge = |handle| Request {
            handle: 20,
            kind: RequestKind::Purge(handle),
        };
        assert_eq!(
            engine.handle_request(purge(2)),
            Some(Confirmation::Purge {
                handle: 20,
                status: PurgeStatus::Success
            })
        );
        assert_eq!(
            engine.handle_request(purge(1)),
            Some(Confirmation::Purge {
                handle: 20,
                status: PurgeStatus::InvalidHandle
            })
        );
        assert_eq!(
            engine.handle_request(Request {
                handle: 21,
                kind: RequestKind::Flush
            }),
            Some(Confirmation::Flush {
                handle: 21,
                status: FlushStatus::Success
            })
        );
        assert_eq!(
            engine.poll(),
            vec![
                Confirmation::Data {
                    handle: 2,
                    status: DataStatus::TransactionFailed
                },
                Confirmation::Data {
                    handle: 3,
                    status: DataStatus::TransactionFailed
                },
            ]
        );
        assert_eq!(engine.frames().len(), 1);
    }

    #[test]
    fn test_start_stop() {
        let (mut engine, _) = started(MacConfig::default());
        let request = |kind| Request { handle: 1, kind };
        assert_eq!(
            engine.handle_request(request(RequestKind::Start)),
            Some(Confirmation::Start {
                handle: 1,
                status: StartStatus::Running
            })
        );
        assert_eq!(
            engine.handle_request(request(RequestKind::Stop)),
            Some(Confirmation::Stop {
                handle: 1,
                status: StopStatus::Success
            })
        );
        assert_eq!(engine.mac_state(), MacState::Idle);
        assert_eq!(
            engine.handle_request(request(RequestKind::Stop)),
            Some(Confirmation::Stop {
                handle: 1,
                status: StopStatus::Error
            })
        );
        assert_eq!(
            engine.handle_request(request(RequestKind::Flush)),
            Some(Confirmation::Flush {
                handle: 1,
                status: FlushStatus::MacIdle
            })
        );
        assert_eq!(
            engine.handle_request(request(RequestKind::Purge(3))),
            Some(Confirmation::Purge {
                handle: 1,
                status: PurgeStatus::Idle
            })
        );
    }

    #[test]
    fn test_get_and_set() {
        let (mut engine, _) = started(MacConfig::default());
        let get = |attribute| Request {
            handle: 1,
            kind: RequestKind::Get(attribute),
        };
        assert_eq!(
            engine.handle_request(get(Attribute::CsmaMaxAttempts)),
            Some(Confirmation::Get {
                handle: 1,
                status: GetStatus::Success,
                value: Some(AttributeValue::U8(10))
            })
        );
        assert_eq!(
            engine.handle_request(get(Attribute::State)),
            Some(Confirmation::Get {
                handle: 1,
                status: GetStatus::Success,
                value: Some(AttributeValue::Text("operational"))
            })
        );
        assert_eq!(
            engine.handle_request(get(Attribute::LinkParamsPeriodS)),
            Some(Confirmation::Get {
                handle: 1,
                status: GetStatus::Unsupported,
                value: None
            })
        );
        assert_eq!(
            engine.handle_request(Request {
                handle: 2,
                kind: RequestKind::Set(Attribute::TxFrameCount, AttributeValue::U32(3))
            }),
            Some(Confirmation::Set {
                handle: 2,
                status: SetStatus::ReadOnly
            })
        );
        assert_eq!(
            engine.handle_request(Request {
                handle: 2,
                kind: RequestKind::Set(Attribute::CsmaPValue, AttributeValue::Float(0.25))
            }),
            Some(Confirmation::Set {
                handle: 2,
                status: SetStatus::Success
            })
        );
        assert_eq!(engine.config().csma_p_value, 0.25);
    }

    #[test]
    fn test_reset_all_restores_defaults() {
        let mut config = MacConfig::default();
        config.csma_max_attempts = 2;
        let (mut engine, _) = started(config);
        MacCounters::incr(&engine.counters().tx_frames);
        assert_eq!(
            engine.handle_request(Request {
                handle: 1,
                kind: RequestKind::Reset(ResetKind::All)
            }),
            Some(Confirmation::Reset {
                handle: 1,
                status: ResetStatus::Success
            })
        );
        assert_eq!(engine.config().csma_max_attempts, 10);
        assert_eq!(engine.counters().snapshot().tx_frames, 0);
    }

    #[test]
    fn test_reset_keeps_spent_throttle_budget() {
        let mut config = MacConfig::default();
        config.csma_p_value = 1.0;
        let (mut engine, _) = started(config);
        engine.state.throttle.consume(30_000, Framing::Srfn);
        assert_eq!(engine.state.throttle.remaining(), 0);

        engine.handle_request(Request {
            handle: 1,
            kind: RequestKind::Reset(ResetKind::All),
        });
        assert_eq!(engine.state.throttle.remaining(), 0);

        engine.handle_request(data(2));
        assert_eq!(
            engine.poll(),
            vec![Confirmation::Data {
                handle: 2,
                status: DataStatus::TransactionFailed
            }]
        );
        assert!(engine.phy().cca_requests.is_empty());
    }

    #[test]
    fn test_link_params_periodic_on_gateway() {
        let mut config = MacConfig::default();
        config.gateway = true;
        config.link_params_period_s = 10;
        let (mut engine, clock) = started(config);

        clock.advance(Duration::from_secs(10));
        engine.pause_tx(true);
        engine.poll();
        assert_eq!(engine.frames().len(), 1);
        clock.advance(Duration::from_secs(10));
        engine.poll();
        assert_eq!(engine.frames().len(), 2);
    }

    #[test]
    fn test_suspend_throttle() {
        let (mut engine, clock) = started(MacConfig::default());
        engine.set_tx_throttle(1);
        engine.suspend_throttle(1);
        assert!(!engine.state.throttle.is_enabled());
        clock.advance(Duration::from_secs(3600));
        engine.poll();
        assert!(engine.state.throttle.is_enabled());
    }

    #[test]
    fn test_next_deadline_tracks_supervisor() {
        let (mut engine, _) = started(MacConfig::default());
        engine.handle_request(data(1));
        engine.poll();
        let now = engine.now();
        assert_eq!(
            engine.next_deadline(),
            Some(now + Duration::from_millis(500))
        );
    }
}
