//! SRFN medium access control.
//!
//! This module contains:
//! - [`engine`]: The MAC engine, request handling and housekeeping
//! - [`csma`]: CSMA/CA channel access for one frame at a time
//! - [`throttle`]: Transmit duty-cycle budget
//! - [`time_sync`]: Time-set distribution and time-request answers
//! - [`frames`]: Transaction queue shared with the engine
//! - [`commands`]: MAC command payload encoding
//! - [`dispatcher`]: Async event loop serialising every engine input

mod channels;
pub mod commands;
mod config;
mod csma;
pub mod dispatcher;
mod engine;
mod frames;
pub mod phy;
mod primitives;
mod random;
pub mod reliability;
mod supervisor;
mod throttle;
pub mod time_sync;
mod timers;

pub use channels::{eligible_channels, pick_channel};
pub use commands::{LinkParameters, NetTime, PingRsp};
pub use config::{
    Attribute, AttributeValue, ChannelRange, ConfigError, MacConfig, TimeQueryResponseMode,
};
pub use csma::AccessState;
pub use dispatcher::{DispatchError, Dispatcher, MacChannel, MacEvent, MacHandle, PhyEvents};
pub use engine::{Engine, MacState};
pub use frames::{Completion, FrameId, FrameManager, Origin, QueueFull, Service, Transaction, TxQueue};
pub use phy::{
    CcaStatus, Channel, ConfirmKind, Framing, PhyConfirm, PhyDataRequest, PhyDataStatus,
    PhyError, RxIndication, Transceiver, TxConstraint,
};
pub use primitives::{
    ChannelSetIndex, ChannelSets, Confirmation, DataRequest, DataStatus, Destination, FlushStatus,
    GetStatus, Handle, Indication, MacAddress, PingRequest, PurgeStatus, Request, RequestKind,
    ResetKind, ResetStatus, SetStatus, StartStatus, StopStatus, TimePushStatus, TimeQueryStatus,
    MAC_ADDRESS_SIZE, MAC_MAX_PAYLOAD, MAX_PRIORITY,
};
pub use random::{RandomSource, RngSource};
pub use reliability::{Reliability, RetryCounts};
pub use supervisor::SyntheticConfirm;
pub use throttle::{ThrottleConfig, TxThrottle};
pub use time_sync::{PushMode, TimeAuthority, TimeRole};
pub use timers::{Clock, SystemClock};
