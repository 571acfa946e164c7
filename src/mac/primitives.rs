//! MAC service primitives: requests, confirmations and status codes.

use serde::{Deserialize, Serialize};

use super::config::{Attribute, AttributeValue};
use super::reliability::Reliability;

/// Caller-supplied request identifier echoed in the confirmation.
pub type Handle = u16;

/// Length of a short MAC address in bytes.
pub const MAC_ADDRESS_SIZE: usize = 5;

/// Short (extension id) MAC address.
pub type MacAddress = [u8; MAC_ADDRESS_SIZE];

/// Largest payload accepted by a data request.
pub const MAC_MAX_PAYLOAD: usize = 1280;

/// Highest request priority.
pub const MAX_PRIORITY: u8 = 7;

/// Destination of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Broadcast,
    Unicast(MacAddress),
}

/// Family of channel sets a frame is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSets {
    Srfn,
    Star,
}

/// Which set inside a family; `Any` means every transmit channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSetIndex {
    Any,
    First,
    Second,
}

impl ChannelSetIndex {
    /// Zero-based set position, `None` for `Any`.
    pub fn position(self) -> Option<usize> {
        match self {
            Self::Any => None,
            Self::First => Some(0),
            Self::Second => Some(1),
        }
    }
}

/// Parameters of a data request.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub dst: Destination,
    pub payload: Vec<u8>,
    pub priority: u8,
    pub reliability: Reliability,
    pub channel_sets: ChannelSets,
    pub channel_set_index: ChannelSetIndex,
    pub droppable: bool,
    /// STAR frames only: transmit without a clear-channel assessment.
    pub skip_cca: bool,
}

impl DataRequest {
    /// Low-reliability SRFN data request on any channel.
    pub fn new(dst: Destination, payload: Vec<u8>) -> Self {
        Self {
            dst,
            payload,
            priority: 0,
            reliability: Reliability::Low,
            channel_sets: ChannelSets::Srfn,
            channel_set_index: ChannelSetIndex::Any,
            droppable: true,
            skip_cca: false,
        }
    }
}

/// Parameters of a ping request.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    pub dst: Destination,
    pub priority: u8,
    pub reliability: Reliability,
    pub channel_set_index: ChannelSetIndex,
    /// Ask the peer to zero its ping counter before counting this ping.
    pub counter_reset: bool,
    /// Ask the peer to answer by unicast instead of broadcast.
    pub unicast_response: bool,
}

/// Scope of a reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Restore default configuration and clear statistics.
    All,
    /// Clear statistics only.
    Statistics,
}

/// Service-specific part of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Data(DataRequest),
    Ping(PingRequest),
    Get(Attribute),
    Set(Attribute, AttributeValue),
    Start,
    Stop,
    Reset(ResetKind),
    Flush,
    Purge(Handle),
    TimeQuery,
}

/// A request submitted by an upper layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub handle: Handle,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataStatus {
    Success,
    MacIdle,
    TransactionOverflow,
    TransactionFailed,
    InvalidParameter,
    InvalidHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStatus {
    Success,
    Unsupported,
    ServiceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    Success,
    ReadOnly,
    Unsupported,
    InvalidParameter,
    ServiceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Success,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Success,
    MacIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStatus {
    Success,
    Idle,
    InvalidHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeQueryStatus {
    Success,
    MacIdle,
    TransactionFailed,
    TransactionOverflow,
}

/// Outcome of a time push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a rejected time push is only visible through its status"]
pub enum TimePushStatus {
    Success,
    InvalidRequest,
    MacIdle,
    /// A broadcast is already scheduled; this one was merged into it.
    Pending,
    TransactionFailed,
    TransactionOverflow,
}

/// Answer to exactly one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Data { handle: Handle, status: DataStatus },
    Ping { handle: Handle, status: DataStatus },
    Get {
        handle: Handle,
        status: GetStatus,
        value: Option<AttributeValue>,
    },
    Set { handle: Handle, status: SetStatus },
    Start { handle: Handle, status: StartStatus },
    Stop { handle: Handle, status: StopStatus },
    Reset { handle: Handle, status: ResetStatus },
    Flush { handle: Handle, status: FlushStatus },
    Purge { handle: Handle, status: PurgeStatus },
    TimeQuery { handle: Handle, status: TimeQueryStatus },
}

impl Confirmation {
    /// Handle of the request this confirmation answers.
    pub fn handle(&self) -> Handle {
        match self {
            Self::Data { handle, .. }
            | Self::Ping { handle, .. }
            | Self::Get { handle, .. }
            | Self::Set { handle, .. }
            | Self::Start { handle, .. }
            | Self::Stop { handle, .. }
            | Self::Reset { handle, .. }
            | Self::Flush { handle, .. }
            | Self::Purge { handle, .. }
            | Self::TimeQuery { handle, .. } => *handle,
        }
    }
}

/// Frame or event handed up to the layer above the MAC.
#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    /// Data frame payload.
    Data { src: MacAddress, payload: Vec<u8>, rssi_dbm: i16 },
    /// Time-set command to be applied by the time module.
    TimeSet { src: MacAddress, payload: Vec<u8> },
    /// Answer to a ping this node sent.
    PingResponse {
        src: MacAddress,
        response: super::commands::PingRsp,
    },
    /// Neighbour link parameters.
    LinkParameters {
        src: MacAddress,
        params: super::commands::LinkParameters,
    },
}
