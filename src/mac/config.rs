//! MAC configuration and the attribute GET/SET surface.
//!
//! [`MacConfig`] is loaded once at start-up (JSON, every field optional) and
//! afterwards changed only through [`MacConfig::set`], which applies a value
//! to a copy, validates the copy and commits it only when valid.
//!
//! # Example
//!
//! ```
//! use srfn_mac::mac::{Attribute, AttributeValue, MacConfig, SetStatus};
//!
//! let mut config = MacConfig::default();
//! assert_eq!(
//!     config.set(Attribute::CsmaMaxAttempts, AttributeValue::U8(4)),
//!     SetStatus::Success
//! );
//! // min backoff may not exceed max backoff
//! assert_eq!(
//!     config.set(Attribute::CsmaMinBackoffMs, AttributeValue::U16(250)),
//!     SetStatus::InvalidParameter
//! );
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::commands::LinkParameters;
use super::primitives::{ChannelSets, SetStatus};
use super::reliability::{Reliability, RetryCounts};
use super::throttle::ThrottleConfig;

pub const MAX_CSMA_ATTEMPTS: u8 = 20;
pub const MAX_CSMA_MIN_BACKOFF_MS: u16 = 100;
pub const MAX_CSMA_MAX_BACKOFF_MS: u16 = 500;
pub const MAX_TRANSACTION_TIMEOUT_S: u16 = 300;
pub const MAX_REASSEMBLY_TIMEOUT_S: u16 = 60;
pub const MAX_CMD_RESP_TIME_DIVERSITY_MS: u16 = 10_000;
pub const MAX_LINK_PARAMS_OFFSET_MS: u32 = 20_000;
pub const MAX_LINK_PARAMS_START_S: u32 = 86_399;
pub const MAX_TX_PACKET_DELAY_MS: u16 = 10_000;
pub const MAX_NETWORK_ID: u8 = 15;
pub const MAX_SRFN_CHANNEL_SETS: usize = 15;
pub const MAX_STAR_CHANNEL_SETS: usize = 2;

/// How this node answers a received time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeQueryResponseMode {
    /// Broadcast a time set after a random diversity delay.
    Broadcast,
    /// Unicast a time set to the requester immediately.
    Unicast,
    Ignore,
}

/// Inclusive range of channel numbers forming one channel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub start: u16,
    pub stop: u16,
}

impl ChannelRange {
    pub const fn new(start: u16, stop: u16) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, channel: u16) -> bool {
        (self.start..=self.stop).contains(&channel)
    }
}

/// Errors detected by [`MacConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Field outside its allowed range.
    OutOfRange(&'static str),
    /// Minimum backoff greater than maximum backoff.
    BackoffOrder { min_ms: u16, max_ms: u16 },
    /// Channel set list too long or containing a reversed range.
    InvalidChannelSets(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange(field) => write!(f, "invalid MAC config: {} out of range", field),
            Self::BackoffOrder { min_ms, max_ms } => write!(
                f,
                "invalid MAC config: min backoff {}ms exceeds max backoff {}ms",
                min_ms, max_ms
            ),
            Self::InvalidChannelSets(which) => {
                write!(f, "invalid MAC config: bad {} channel sets", which)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration of the MAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    pub csma_max_attempts: u8,
    pub csma_min_backoff_ms: u16,
    pub csma_max_backoff_ms: u16,
    /// Probability of transmitting on a clear channel.
    pub csma_p_value: f32,
    /// Fail the transaction when persistence declines instead of retrying.
    pub csma_quick_abort: bool,
    pub reliability: RetryCounts,
    pub transaction_timeout_s: u16,
    pub reassembly_timeout_s: u16,
    pub packet_timeout_ms: u16,
    pub cmd_resp_max_time_diversity_ms: u16,
    pub link_params_max_offset_ms: u32,
    /// Period of link-parameter broadcasts, zero disables them.
    pub link_params_period_s: u32,
    /// Seconds after midnight the link-parameter schedule is aligned to.
    pub link_params_start_s: u32,
    /// Minimum gap between consecutive transmissions.
    pub tx_packet_delay_ms: u16,
    pub network_id: u8,
    pub time_query_response_mode: TimeQueryResponseMode,
    /// Node is a collector. Gateway-only attributes are unsupported otherwise.
    pub gateway: bool,
    pub srfn_channel_sets: Vec<ChannelRange>,
    pub star_channel_sets: Vec<ChannelRange>,
    pub throttle: ThrottleConfig,
    /// Values advertised in link-parameter broadcasts.
    pub link_parameters: LinkParameters,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            csma_max_attempts: 10,
            csma_min_backoff_ms: 30,
            csma_max_backoff_ms: 100,
            csma_p_value: 0.5,
            csma_quick_abort: false,
            reliability: RetryCounts::default(),
            transaction_timeout_s: 60,
            reassembly_timeout_s: 60,
            packet_timeout_ms: 2_000,
            cmd_resp_max_time_diversity_ms: 1_000,
            link_params_max_offset_ms: 10_000,
            link_params_period_s: 3_600,
            link_params_start_s: 1_765,
            tx_packet_delay_ms: 0,
            network_id: 0,
            time_query_response_mode: TimeQueryResponseMode::Broadcast,
            gateway: false,
            srfn_channel_sets: vec![ChannelRange::new(2656, 2880), ChannelRange::new(960, 1280)],
            star_channel_sets: vec![ChannelRange::new(1680, 1919), ChannelRange::new(2160, 2399)],
            throttle: ThrottleConfig::default(),
            link_parameters: LinkParameters::default(),
        }
    }
}

impl MacConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check every field against its limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csma_max_attempts > MAX_CSMA_ATTEMPTS {
            return Err(ConfigError::OutOfRange("csma_max_attempts"));
        }
        if self.csma_min_backoff_ms > MAX_CSMA_MIN_BACKOFF_MS {
            return Err(ConfigError::OutOfRange("csma_min_backoff_ms"));
        }
        if self.csma_max_backoff_ms > MAX_CSMA_MAX_BACKOFF_MS {
            return Err(ConfigError::OutOfRange("csma_max_backoff_ms"));
        }
        if self.csma_min_backoff_ms > self.csma_max_backoff_ms {
            return Err(ConfigError::BackoffOrder {
                min_ms: self.csma_min_backoff_ms,
                max_ms: self.csma_max_backoff_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.csma_p_value) {
            return Err(ConfigError::OutOfRange("csma_p_value"));
        }
        if !self.reliability.is_valid() {
            return Err(ConfigError::OutOfRange("reliability"));
        }
        if !(1..=MAX_TRANSACTION_TIMEOUT_S).contains(&self.transaction_timeout_s) {
            return Err(ConfigError::OutOfRange("transaction_timeout_s"));
        }
        if !(1..=MAX_REASSEMBLY_TIMEOUT_S).contains(&self.reassembly_timeout_s) {
            return Err(ConfigError::OutOfRange("reassembly_timeout_s"));
        }
        if self.cmd_resp_max_time_diversity_ms > MAX_CMD_RESP_TIME_DIVERSITY_MS {
            return Err(ConfigError::OutOfRange("cmd_resp_max_time_diversity_ms"));
        }
        if self.link_params_max_offset_ms > MAX_LINK_PARAMS_OFFSET_MS {
            return Err(ConfigError::OutOfRange("link_params_max_offset_ms"));
        }
        if self.link_params_start_s > MAX_LINK_PARAMS_START_S {
            return Err(ConfigError::OutOfRange("link_params_start_s"));
        }
        if self.tx_packet_delay_ms > MAX_TX_PACKET_DELAY_MS {
            return Err(ConfigError::OutOfRange("tx_packet_delay_ms"));
        }
        if self.network_id > MAX_NETWORK_ID {
            return Err(ConfigError::OutOfRange("network_id"));
        }
        validate_sets(&self.srfn_channel_sets, MAX_SRFN_CHANNEL_SETS, "SRFN")?;
        validate_sets(&self.star_channel_sets, MAX_STAR_CHANNEL_SETS, "STAR")?;
        if self.throttle.duty_cycle_percent == 0 || self.throttle.duty_cycle_percent > 100 {
            return Err(ConfigError::OutOfRange("throttle.duty_cycle_percent"));
        }
        if self.throttle.intervals < 2 {
            return Err(ConfigError::OutOfRange("throttle.intervals"));
        }
        if self.throttle.interval_minutes == 0 {
            return Err(ConfigError::OutOfRange("throttle.interval_minutes"));
        }
        if self.throttle.bit_rate == 0 {
            return Err(ConfigError::OutOfRange("throttle.bit_rate"));
        }
        Ok(())
    }

    /// Channel sets of one family.
    pub fn channel_sets(&self, family: ChannelSets) -> &[ChannelRange] {
        match family {
            ChannelSets::Srfn => &self.srfn_channel_sets,
            ChannelSets::Star => &self.star_channel_sets,
        }
    }

    pub fn retry_count(&self, level: Reliability) -> u8 {
        self.reliability.retry_count(level)
    }

    /// Link-parameter broadcasts are sent by gateways with a non-zero period.
    pub fn link_params_enabled(&self) -> bool {
        self.gateway && self.link_params_period_s != 0
    }

    /// Current value of a configuration attribute.
    ///
    /// Returns `None` for statistics attributes, which the engine answers
    /// from its counters, and for gateway-only attributes on other nodes.
    pub fn get(&self, attribute: Attribute) -> Option<AttributeValue> {
        if attribute.is_gateway_only() && !self.gateway {
            return None;
        }
        let value = match attribute {
            Attribute::CsmaMaxAttempts => AttributeValue::U8(self.csma_max_attempts),
            Attribute::CsmaMinBackoffMs => AttributeValue::U16(self.csma_min_backoff_ms),
            Attribute::CsmaMaxBackoffMs => AttributeValue::U16(self.csma_max_backoff_ms),
            Attribute::CsmaPValue => AttributeValue::Float(self.csma_p_value),
            Attribute::CsmaQuickAbort => AttributeValue::Bool(self.csma_quick_abort),
            Attribute::ReliabilityLowCount => AttributeValue::U8(self.reliability.low),
            Attribute::ReliabilityMediumCount => AttributeValue::U8(self.reliability.medium),
            Attribute::ReliabilityHighCount => AttributeValue::U8(self.reliability.high),
            Attribute::TransactionTimeoutS => AttributeValue::U16(self.transaction_timeout_s),
            Attribute::ReassemblyTimeoutS => AttributeValue::U16(self.reassembly_timeout_s),
            Attribute::PacketTimeoutMs => AttributeValue::U16(self.packet_timeout_ms),
            Attribute::CmdRespMaxTimeDiversityMs => {
                AttributeValue::U16(self.cmd_resp_max_time_diversity_ms)
            }
            Attribute::LinkParamsMaxOffsetMs => AttributeValue::U32(self.link_params_max_offset_ms),
            Attribute::LinkParamsPeriodS => AttributeValue::U32(self.link_params_period_s),
            Attribute::LinkParamsStartS => AttributeValue::U32(self.link_params_start_s),
            Attribute::TxPacketDelayMs => AttributeValue::U16(self.tx_packet_delay_ms),
            Attribute::NetworkId => AttributeValue::U8(self.network_id),
            Attribute::TimeQueryResponseMode => {
                AttributeValue::ResponseMode(self.time_query_response_mode)
            }
            Attribute::SrfnChannelSets => AttributeValue::ChannelSets(self.srfn_channel_sets.clone()),
            Attribute::StarChannelSets => AttributeValue::ChannelSets(self.star_channel_sets.clone()),
            Attribute::SrfnChannelSetsCount => AttributeValue::U8(self.srfn_channel_sets.len() as u8),
            Attribute::StarChannelSetsCount => AttributeValue::U8(self.star_channel_sets.len() as u8),
            _ => return None,
        };
        Some(value)
    }

    /// Change one attribute. The configuration is left untouched unless the
    /// status is [`SetStatus::Success`].
    pub fn set(&mut self, attribute: Attribute, value: AttributeValue) -> SetStatus {
        if attribute.is_read_only() {
            return SetStatus::ReadOnly;
        }
        if attribute.is_gateway_only() && !self.gateway {
            return SetStatus::Unsupported;
        }

        let mut next = self.clone();
        match (attribute, value) {
            (Attribute::CsmaMaxAttempts, AttributeValue::U8(v)) => next.csma_max_attempts = v,
            (Attribute::CsmaMinBackoffMs, AttributeValue::U16(v)) => next.csma_min_backoff_ms = v,
            (Attribute::CsmaMaxBackoffMs, AttributeValue::U16(v)) => next.csma_max_backoff_ms = v,
            (Attribute::CsmaPValue, AttributeValue::Float(v)) => next.csma_p_value = v,
            (Attribute::CsmaQuickAbort, AttributeValue::Bool(v)) => next.csma_quick_abort = v,
            (Attribute::ReliabilityLowCount, AttributeValue::U8(v)) => next.reliability.low = v,
            (Attribute::ReliabilityMediumCount, AttributeValue::U8(v)) => {
                next.reliability.medium = v
            }
            (Attribute::ReliabilityHighCount, AttributeValue::U8(v)) => next.reliability.high = v,
            (Attribute::TransactionTimeoutS, AttributeValue::U16(v)) => {
                next.transaction_timeout_s = v
            }
            (Attribute::ReassemblyTimeoutS, AttributeValue::U16(v)) => {
                next.reassembly_timeout_s = v
            }
            (Attribute::PacketTimeoutMs, AttributeValue::U16(v)) => next.packet_timeout_ms = v,
            (Attribute::CmdRespMaxTimeDiversityMs, AttributeValue::U16(v)) => {
                next.cmd_resp_max_time_diversity_ms = v
            }
            (Attribute::LinkParamsMaxOffsetMs, AttributeValue::U32(v)) => {
                next.link_params_max_offset_ms = v
            }
            (Attribute::LinkParamsPeriodS, AttributeValue::U32(v)) => next.link_params_period_s = v,
            (Attribute::LinkParamsStartS, AttributeValue::U32(v)) => next.link_params_start_s = v,
            (Attribute::TxPacketDelayMs, AttributeValue::U16(v)) => next.tx_packet_delay_ms = v,
            (Attribute::NetworkId, AttributeValue::U8(v)) => next.network_id = v,
            (Attribute::TimeQueryResponseMode, AttributeValue::ResponseMode(v)) => {
                next.time_query_response_mode = v
            }
            (Attribute::SrfnChannelSets, AttributeValue::ChannelSets(v)) => {
                next.srfn_channel_sets = v
            }
            (Attribute::StarChannelSets, AttributeValue::ChannelSets(v)) => {
                next.star_channel_sets = v
            }
            _ => return SetStatus::InvalidParameter,
        }

        match next.validate() {
            Ok(()) => {
                *self = next;
                SetStatus::Success
            }
            Err(_) => SetStatus::InvalidParameter,
        }
    }
}

fn validate_sets(
    sets: &[ChannelRange],
    max: usize,
    which: &'static str,
) -> Result<(), ConfigError> {
    if sets.len() > max || sets.iter().any(|range| range.start > range.stop) {
        return Err(ConfigError::InvalidChannelSets(which));
    }
    Ok(())
}

/// Attributes reachable through GET/SET requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    CsmaMaxAttempts,
    CsmaMinBackoffMs,
    CsmaMaxBackoffMs,
    CsmaPValue,
    CsmaQuickAbort,
    ReliabilityLowCount,
    ReliabilityMediumCount,
    ReliabilityHighCount,
    TransactionTimeoutS,
    ReassemblyTimeoutS,
    PacketTimeoutMs,
    CmdRespMaxTimeDiversityMs,
    LinkParamsMaxOffsetMs,
    LinkParamsPeriodS,
    LinkParamsStartS,
    TxPacketDelayMs,
    NetworkId,
    TimeQueryResponseMode,
    SrfnChannelSets,
    StarChannelSets,
    // Read-only
    SrfnChannelSetsCount,
    StarChannelSetsCount,
    State,
    ChannelAccessFailureCount,
    TxFrameCount,
    TxLinkDelayCount,
    TxLinkDelayTimeMs,
    TransactionOverflowCount,
    TransactionTimeoutCount,
    PingCount,
    ThrottleRemaining,
}

impl Attribute {
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::SrfnChannelSetsCount
                | Self::StarChannelSetsCount
                | Self::State
                | Self::ChannelAccessFailureCount
                | Self::TxFrameCount
                | Self::TxLinkDelayCount
                | Self::TxLinkDelayTimeMs
                | Self::TransactionOverflowCount
                | Self::TransactionTimeoutCount
                | Self::PingCount
                | Self::ThrottleRemaining
        )
    }

    /// Attributes that only exist on gateway nodes.
    pub fn is_gateway_only(self) -> bool {
        matches!(
            self,
            Self::LinkParamsMaxOffsetMs
                | Self::LinkParamsPeriodS
                | Self::LinkParamsStartS
                | Self::TxPacketDelayMs
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CsmaMaxAttempts => "csma_max_attempts",
            Self::CsmaMinBackoffMs => "csma_min_backoff_ms",
            Self::CsmaMaxBackoffMs => "csma_max_backoff_ms",
            Self::CsmaPValue => "csma_p_value",
            Self::CsmaQuickAbort => "csma_quick_abort",
            Self::ReliabilityLowCount => "reliability_low_count",
            Self::ReliabilityMediumCount => "reliability_medium_count",
            Self::ReliabilityHighCount => "reliability_high_count",
            Self::TransactionTimeoutS => "transaction_timeout_s",
            Self::ReassemblyTimeoutS => "reassembly_timeout_s",
            Self::PacketTimeoutMs => "packet_timeout_ms",
            Self::CmdRespMaxTimeDiversityMs => "cmd_resp_max_time_diversity_ms",
            Self::LinkParamsMaxOffsetMs => "link_params_max_offset_ms",
            Self::LinkParamsPeriodS => "link_params_period_s",
            Self::LinkParamsStartS => "link_params_start_s",
            Self::TxPacketDelayMs => "tx_packet_delay_ms",
            Self::NetworkId => "network_id",
            Self::TimeQueryResponseMode => "time_query_response_mode",
            Self::SrfnChannelSets => "srfn_channel_sets",
            Self::StarChannelSets => "star_channel_sets",
            Self::SrfnChannelSetsCount => "srfn_channel_sets_count",
            Self::StarChannelSetsCount => "star_channel_sets_count",
            Self::State => "state",
            Self::ChannelAccessFailureCount => "channel_access_failure_count",
            Self::TxFrameCount => "tx_frame_count",
            Self::TxLinkDelayCount => "tx_link_delay_count",
            Self::TxLinkDelayTimeMs => "tx_link_delay_time_ms",
            Self::TransactionOverflowCount => "transaction_overflow_count",
            Self::TransactionTimeoutCount => "transaction_timeout_count",
            Self::PingCount => "ping_count",
            Self::ThrottleRemaining => "throttle_remaining",
        }
    }

    const ALL: [Attribute; 31] = [
        Self::CsmaMaxAttempts,
        Self::CsmaMinBackoffMs,
        Self::CsmaMaxBackoffMs,
        Self::CsmaPValue,
        Self::CsmaQuickAbort,
        Self::ReliabilityLowCount,
        Self::ReliabilityMediumCount,
        Self::ReliabilityHighCount,
        Self::TransactionTimeoutS,
        Self::ReassemblyTimeoutS,
        Self::PacketTimeoutMs,
        Self::CmdRespMaxTimeDiversityMs,
        Self::LinkParamsMaxOffsetMs,
        Self::LinkParamsPeriodS,
        Self::LinkParamsStartS,
        Self::TxPacketDelayMs,
        Self::NetworkId,
        Self::TimeQueryResponseMode,
        Self::SrfnChannelSets,
        Self::StarChannelSets,
        Self::SrfnChannelSetsCount,
        Self::StarChannelSetsCount,
        Self::State,
        Self::ChannelAccessFailureCount,
        Self::TxFrameCount,
        Self::TxLinkDelayCount,
        Self::TxLinkDelayTimeMs,
        Self::TransactionOverflowCount,
        Self::TransactionTimeoutCount,
        Self::PingCount,
        Self::ThrottleRemaining,
    ];
}

impl FromStr for Attribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|attr| attr.name() == s)
            .ok_or_else(|| format!("unknown MAC attribute: {}", s))
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Value carried by GET confirmations and SET requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    Float(f32),
    ResponseMode(TimeQueryResponseMode),
    ChannelSets(Vec<ChannelRange>),
    Text(&'static str),
}
