//! MAC command frame payloads.
//!
//! Command frames carry a one-byte command id followed by a bit-packed,
//! big-endian body. Time fields are 64-bit network time (32-bit seconds plus
//! a 32-bit binary fraction); fields marked "stamped at transmit" are left
//! zero here and filled in by the frame encoder.
//!
//! # Example
//!
//! ```
//! use srfn_mac::mac::commands::{self, Command, NetTime, PingReq};
//!
//! let req = PingReq {
//!     handle: 7,
//!     tx_time: NetTime::new(1_700_000_000, 0),
//!     counter_reset: true,
//!     unicast_response: false,
//! };
//! let bytes = req.encode();
//! assert_eq!(bytes.len(), commands::PING_REQ_LEN);
//! assert_eq!(commands::parse(&bytes), Ok(Command::PingReq(req)));
//! ```

use serde::{Deserialize, Serialize};

use super::primitives::{ChannelSetIndex, MacAddress, MAC_ADDRESS_SIZE};

pub const TIME_SET_LEN: usize = 11;
pub const TIME_REQ_LEN: usize = 1;
pub const PING_REQ_LEN: usize = 12;
pub const PING_RSP_LEN: usize = 38;
pub const LINK_PARAM_LEN: usize = 8;

/// Command identifier, the first byte of every command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    TimeSet = 0,
    TimeReq = 1,
    PingReq = 2,
    PingRsp = 3,
    LinkParam = 4,
}

impl CommandId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::TimeSet),
            1 => Some(Self::TimeReq),
            2 => Some(Self::PingReq),
            3 => Some(Self::PingRsp),
            4 => Some(Self::LinkParam),
            _ => None,
        }
    }

    /// Encoded payload length including the id byte.
    pub fn payload_len(self) -> usize {
        match self {
            Self::TimeSet => TIME_SET_LEN,
            Self::TimeReq => TIME_REQ_LEN,
            Self::PingReq => PING_REQ_LEN,
            Self::PingRsp => PING_RSP_LEN,
            Self::LinkParam => LINK_PARAM_LEN,
        }
    }

    /// Queue priority of frames this node originates.
    pub fn priority(self) -> u8 {
        match self {
            Self::TimeSet | Self::LinkParam => 5,
            Self::TimeReq | Self::PingReq | Self::PingRsp => 7,
        }
    }

    pub fn droppable(self) -> bool {
        !matches!(self, Self::TimeSet)
    }

    pub fn channel_set_index(self) -> ChannelSetIndex {
        match self {
            Self::TimeSet | Self::LinkParam => ChannelSetIndex::First,
            Self::TimeReq | Self::PingReq | Self::PingRsp => ChannelSetIndex::Second,
        }
    }
}

/// Network time: whole seconds plus a 32-bit binary fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetTime {
    pub seconds: u32,
    pub fraction: u32,
}

impl NetTime {
    pub const fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    fn to_bits(self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.fraction)
    }

    fn from_bits(bits: u64) -> Self {
        Self {
            seconds: (bits >> 32) as u32,
            fraction: bits as u32,
        }
    }
}

/// Errors raised while parsing a command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    UnknownCommand(u8),
    Truncated {
        command: CommandId,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty MAC command"),
            Self::UnknownCommand(id) => write!(f, "unknown MAC command id {}", id),
            Self::Truncated {
                command,
                expected,
                actual,
            } => write!(
                f,
                "{:?} command truncated: {} bytes, expected {}",
                command, actual, expected
            ),
        }
    }
}

impl std::error::Error for CommandError {}

/// Big-endian bit packer.
struct BitWriter {
    buf: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn new(command: CommandId) -> Self {
        let mut buf = vec![0u8; command.payload_len()];
        buf[0] = command as u8;
        Self { buf, bit: 8 }
    }

    fn put(&mut self, value: u64, width: usize) {
        for i in (0..width).rev() {
            if (value >> i) & 1 == 1 {
                self.buf[self.bit / 8] |= 0x80 >> (self.bit % 8);
            }
            self.bit += 1;
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.put(u64::from(*byte), 8);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader over a payload whose length was checked up front.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 8 }
    }

    fn get(&mut self, width: usize) -> u64 {
        let mut value = 0u64;
        for _ in 0..width {
            let set = self.data[self.bit / 8] & (0x80 >> (self.bit % 8)) != 0;
            value = (value << 1) | u64::from(set);
            self.bit += 1;
        }
        value
    }

    fn get_flag(&mut self) -> bool {
        self.get(1) == 1
    }

    fn get_address(&mut self) -> MacAddress {
        let mut addr = [0u8; MAC_ADDRESS_SIZE];
        for byte in addr.iter_mut() {
            *byte = self.get(8) as u8;
        }
        addr
    }
}

/// Time-set command with the time left for the encoder to stamp.
pub fn time_set() -> Vec<u8> {
    BitWriter::new(CommandId::TimeSet).finish()
}

pub fn time_req() -> Vec<u8> {
    BitWriter::new(CommandId::TimeReq).finish()
}

/// Scale a received signal strength to the 12-bit wire representation.
pub fn scale_rssi(dbm: i16) -> u16 {
    ((i32::from(dbm) + 200) * 16).clamp(0, 0x0FFF) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReq {
    pub handle: u16,
    pub tx_time: NetTime,
    /// Responder zeroes its ping counter before counting this request.
    pub counter_reset: bool,
    /// Responder answers by unicast instead of broadcast.
    pub unicast_response: bool,
}

impl PingReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::new(CommandId::PingReq);
        w.put(u64::from(self.handle), 16);
        w.put(self.tx_time.to_bits(), 64);
        w.put(u64::from(self.counter_reset), 1);
        w.put(u64::from(self.unicast_response), 1);
        w.put(0, 6);
        w.finish()
    }

    fn decode(r: &mut BitReader<'_>) -> Self {
        let handle = r.get(16) as u16;
        let tx_time = NetTime::from_bits(r.get(64));
        let counter_reset = r.get_flag();
        let unicast_response = r.get_flag();
        let _reserved = r.get(6);
        Self {
            handle,
            tx_time,
            counter_reset,
            unicast_response,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRsp {
    pub handle: u16,
    /// Address of the node that sent the request.
    pub origin: MacAddress,
    pub req_tx_time: NetTime,
    pub counter_reset: bool,
    pub unicast_response: bool,
    pub req_rx_time: NetTime,
    /// Stamped at transmit.
    pub rsp_tx_time: NetTime,
    pub ping_count: u16,
    /// 12-bit scaled RSSI, see [`scale_rssi`].
    pub req_rssi: u16,
    pub req_channel: u16,
}

impl PingRsp {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::new(CommandId::PingRsp);
        w.put(u64::from(self.handle), 16);
        w.put_bytes(&self.origin);
        w.put(self.req_tx_time.to_bits(), 64);
        w.put(u64::from(self.counter_reset), 1);
        w.put(u64::from(self.unicast_response), 1);
        w.put(0, 6);
        w.put(self.req_rx_time.to_bits(), 64);
        w.put(self.rsp_tx_time.to_bits(), 64);
        w.put(u64::from(self.ping_count), 16);
        w.put(u64::from(self.req_rssi & 0x0FFF), 12);
        w.put(u64::from(self.req_channel & 0x0FFF), 12);
        w.finish()
    }

    fn decode(r: &mut BitReader<'_>) -> Self {
        let handle = r.get(16) as u16;
        let origin = r.get_address();
        let req_tx_time = NetTime::from_bits(r.get(64));
        let counter_reset = r.get_flag();
        let unicast_response = r.get_flag();
        let _reserved = r.get(6);
        Self {
            handle,
            origin,
            req_tx_time,
            counter_reset,
            unicast_response,
            req_rx_time: NetTime::from_bits(r.get(64)),
            rsp_tx_time: NetTime::from_bits(r.get(64)),
            ping_count: r.get(16) as u16,
            req_rssi: r.get(12) as u16,
            req_channel: r.get(12) as u16,
        }
    }
}

/// Radio link description broadcast periodically by gateways.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkParameters {
    /// 3 bits.
    pub node_role: u8,
    pub tx_power: u8,
    pub tx_power_headroom: u8,
    /// 3 bits.
    pub frequency_accuracy: u8,
    /// 5 bits.
    pub rpt_count: u8,
    /// 4 bits.
    pub channel_band: u8,
    /// 12 bits.
    pub channel_offset: u16,
    pub rpt: u8,
}

impl LinkParameters {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::new(CommandId::LinkParam);
        w.put(u64::from(self.node_role & 0x07), 3);
        w.put(0, 5);
        w.put(u64::from(self.tx_power), 8);
        w.put(u64::from(self.tx_power_headroom), 8);
        w.put(u64::from(self.frequency_accuracy & 0x07), 3);
        w.put(u64::from(self.rpt_count & 0x1F), 5);
        w.put(u64::from(self.channel_band & 0x0F), 4);
        w.put(u64::from(self.channel_offset & 0x0FFF), 12);
        w.put(u64::from(self.rpt), 8);
        w.finish()
    }

    fn decode(r: &mut BitReader<'_>) -> Self {
        let node_role = r.get(3) as u8;
        let _reserved = r.get(5);
        Self {
            node_role,
            tx_power: r.get(8) as u8,
            tx_power_headroom: r.get(8) as u8,
            frequency_accuracy: r.get(3) as u8,
            rpt_count: r.get(5) as u8,
            channel_band: r.get(4) as u8,
            channel_offset: r.get(12) as u16,
            rpt: r.get(8) as u8,
        }
    }
}

/// A parsed command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Raw time-set payload, handed to the time module unchanged.
    TimeSet(Vec<u8>),
    TimeReq,
    PingReq(PingReq),
    PingRsp(PingRsp),
    LinkParam(LinkParameters),
}

/// Parse a command payload, id byte included.
pub fn parse(payload: &[u8]) -> Result<Command, CommandError> {
    let first = *payload.first().ok_or(CommandError::Empty)?;
    let command = CommandId::from_byte(first).ok_or(CommandError::UnknownCommand(first))?;
    let expected = command.payload_len();
    if payload.len() < expected {
        return Err(CommandError::Truncated {
            command,
            expected,
            actual: payload.len(),
        });
    }

    let mut r = BitReader::new(payload);
    Ok(match command {
        CommandId::TimeSet => Command::TimeSet(payload[..expected].to_vec()),
        CommandId::TimeReq => Command::TimeReq,
        CommandId::PingReq => Command::PingReq(PingReq::decode(&mut r)),
        CommandId::PingRsp => Command::PingRsp(PingRsp::decode(&mut r)),
        CommandId::LinkParam => Command::LinkParam(LinkParameters::decode(&mut r)),
    })
}
