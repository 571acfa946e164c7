//! Deterministic collaborators for engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::mac::phy::{Channel, Framing, PhyDataRequest, PhyError, Transceiver, TxConstraint};
use crate::mac::{Clock, Destination, RandomSource};

#[derive(Debug)]
struct ClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

/// Clock that only moves when told to. Sleeping advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                now: Instant::now(),
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().now += by;
    }

    /// Every sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().unwrap().now
    }

    fn sleep(&mut self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Random source answering from queues. Empty queues give the smallest
/// possible value.
#[derive(Debug, Default)]
pub struct ScriptedRandom {
    pub units: VecDeque<f32>,
    pub ranges: VecDeque<u32>,
}

impl RandomSource for ScriptedRandom {
    fn unit(&mut self) -> f32 {
        self.units.pop_front().unwrap_or(0.0)
    }

    fn range_inclusive(&mut self, min: u32, max: u32) -> u32 {
        self.ranges
            .pop_front()
            .map_or(min, |value| value.clamp(min, max.max(min)))
    }

    fn index(&mut self, _len: usize) -> usize {
        0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub channel: Channel,
    pub dst: Destination,
    pub is_command: bool,
    pub payload: Vec<u8>,
    pub framing: Framing,
    pub constraint: TxConstraint,
}

/// Transceiver that records requests and never confirms on its own.
#[derive(Debug, Default)]
pub struct RecordingPhy {
    pub channels: Vec<Channel>,
    pub cca_requests: Vec<Channel>,
    pub sent: Vec<SentFrame>,
    pub resets: usize,
    pub refuse_cca: bool,
    pub refuse_data: bool,
}

impl RecordingPhy {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }
}

impl Transceiver for RecordingPhy {
    fn tx_channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn cca_request(&mut self, channel: Channel) -> Result<(), PhyError> {
        if self.refuse_cca {
            return Err(PhyError::NotReady);
        }
        self.cca_requests.push(channel);
        Ok(())
    }

    fn data_request(&mut self, request: &PhyDataRequest<'_>) -> Result<(), PhyError> {
        if self.refuse_data {
            return Err(PhyError::NotReady);
        }
        self.sent.push(SentFrame {
            channel: request.channel,
            dst: request.dst,
            is_command: request.is_command,
            payload: request.payload.to_vec(),
            framing: request.framing,
            constraint: request.constraint,
        });
        Ok(())
    }

    fn reset_request(&mut self) -> Result<(), PhyError> {
        self.resets += 1;
        Ok(())
    }
}
