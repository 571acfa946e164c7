//! In-process radio simulation.
//!
//! An [`Ether`] is a shared medium: a transmission occupies it for the
//! frame's airtime and is then delivered to every listening node. A
//! [`SimTransceiver`] implements [`Transceiver`] on top of it, answering
//! requests asynchronously through [`PhyEvents`] the way a radio driver
//! would. Used by the `node` binary and end-to-end tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::mac::phy::ResetStatus;
use crate::mac::{
    CcaStatus, Channel, ConfigError, Destination, Dispatcher, Engine, Framing, Indication,
    MacAddress, MacChannel, MacConfig, MacHandle, NetTime, PhyConfirm, PhyDataRequest,
    PhyDataStatus, PhyError, PhyEvents, RngSource, RxIndication, SystemClock, Transceiver,
    TxQueue, MAC_MAX_PAYLOAD,
};
use crate::stats::MacCounters;

/// Time a clear-channel assessment listens for.
pub const CCA_LISTEN_TIME: Duration = Duration::from_millis(5);
/// Signal strength reported for every simulated reception.
pub const SIM_RSSI_DBM: i16 = -70;
/// Transmit channels of a simulated radio: one per SRFN and STAR set.
pub const SIM_CHANNELS: [Channel; 4] = [2700, 1000, 1700, 2200];

/// A frame on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirFrame {
    pub src: MacAddress,
    pub dst: Destination,
    pub is_command: bool,
    pub payload: Vec<u8>,
    pub channel: Channel,
}

/// Shared simulated medium.
#[derive(Debug, Clone)]
pub struct Ether {
    busy_until: Arc<Mutex<Option<Instant>>>,
    frames: broadcast::Sender<AirFrame>,
    bit_rate: u32,
}

impl Ether {
    pub fn new(bit_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            busy_until: Arc::new(Mutex::new(None)),
            frames,
            bit_rate: bit_rate.max(1),
        }
    }

    /// Time on air for `bytes` of payload.
    pub fn airtime(&self, bytes: usize, framing: Framing) -> Duration {
        let bits = (bytes as u64 + u64::from(framing.overhead())) * 8;
        Duration::from_micros(bits * 1_000_000 / u64::from(self.bit_rate))
    }

    pub fn is_busy(&self) -> bool {
        let busy_until = self.busy_until.lock().unwrap_or_else(PoisonError::into_inner);
        busy_until.map_or(false, |until| Instant::now() < until)
    }

    fn occupy(&self, airtime: Duration) {
        let mut busy_until = self.busy_until.lock().unwrap_or_else(PoisonError::into_inner);
        let end = Instant::now() + airtime;
        *busy_until = Some(busy_until.map_or(end, |current| current.max(end)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AirFrame> {
        self.frames.subscribe()
    }

    fn deliver(&self, frame: AirFrame) {
        if self.frames.send(frame).is_err() {
            debug!("frame sent with nobody listening");
        }
    }
}

fn net_time_now() -> NetTime {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let fraction = (u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000;
    NetTime::new(since_epoch.as_secs() as u32, fraction as u32)
}

/// Simulated radio attached to an [`Ether`].
pub struct SimTransceiver {
    address: MacAddress,
    channels: Vec<Channel>,
    ether: Ether,
    events: PhyEvents,
}

impl SimTransceiver {
    pub fn new(address: MacAddress, channels: Vec<Channel>, ether: Ether, events: PhyEvents) -> Self {
        Self {
            address,
            channels,
            ether,
            events,
        }
    }

    fn runtime() -> Result<Handle, PhyError> {
        Handle::try_current().map_err(|_| PhyError::NotReady)
    }

    /// Forward frames heard on the ether to the MAC until cancelled.
    pub fn spawn_receiver(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut air = self.ether.subscribe();
        let address = self.address;
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = air.recv() => result,
                };
                match frame {
                    Ok(frame) => {
                        if frame.src == address {
                            continue;
                        }
                        if let Destination::Unicast(dst) = frame.dst {
                            if dst != address {
                                continue;
                            }
                        }
                        let rx = RxIndication {
                            src: frame.src,
                            is_command: frame.is_command,
                            payload: frame.payload,
                            rssi_dbm: SIM_RSSI_DBM,
                            channel: frame.channel,
                            rx_time: net_time_now(),
                        };
                        if events.indication(rx).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("receiver {:02x?} missed {} frames", address, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("receiver {:02x?} stopped", address);
        })
    }
}

impl Transceiver for SimTransceiver {
    fn tx_channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn cca_request(&mut self, channel: Channel) -> Result<(), PhyError> {
        if !self.channels.contains(&channel) {
            return Err(PhyError::InvalidParameter("channel"));
        }
        let runtime = Self::runtime()?;
        let ether = self.ether.clone();
        let events = self.events.clone();
        runtime.spawn(async move {
            tokio::time::sleep(CCA_LISTEN_TIME).await;
            let clear = !ether.is_busy();
            let _ = events.confirm(PhyConfirm::Cca {
                status: CcaStatus::Success,
                clear,
            });
        });
        Ok(())
    }

    fn data_request(&mut self, request: &PhyDataRequest<'_>) -> Result<(), PhyError> {
        if request.payload.is_empty() || request.payload.len() > MAC_MAX_PAYLOAD {
            return Err(PhyError::InvalidParameter("payload length"));
        }
        let runtime = Self::runtime()?;
        let airtime = self.ether.airtime(request.payload.len(), request.framing);
        self.ether.occupy(airtime);

        let frame = AirFrame {
            src: self.address,
            dst: request.dst,
            is_command: request.is_command,
            payload: request.payload.to_vec(),
            channel: request.channel,
        };
        let ether = self.ether.clone();
        let events = self.events.clone();
        runtime.spawn(async move {
            tokio::time::sleep(airtime).await;
            ether.deliver(frame);
            let _ = events.confirm(PhyConfirm::Data {
                status: PhyDataStatus::Success,
                delay_ms: 0,
            });
        });
        Ok(())
    }

    fn reset_request(&mut self) -> Result<(), PhyError> {
        info!("simulated radio {:02x?} reset", self.address);
        self.events.confirm(PhyConfirm::Reset {
            status: ResetStatus::Success,
        })
    }
}

/// Errors raised while bringing up a simulated node.
#[derive(Debug)]
pub enum SimError {
    Config(ConfigError),
    Random(rand::Error),
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid MAC configuration: {}", e),
            Self::Random(e) => write!(f, "random source unavailable: {}", e),
        }
    }
}

impl std::error::Error for SimError {}

impl From<ConfigError> for SimError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<rand::Error> for SimError {
    fn from(e: rand::Error) -> Self {
        Self::Random(e)
    }
}

/// A running simulated node.
pub struct SimNode {
    pub address: MacAddress,
    pub mac: MacHandle,
    pub indications: mpsc::UnboundedReceiver<Indication>,
    pub counters: Arc<MacCounters>,
}

/// Start a MAC with a simulated radio on `ether`. A `seed` makes the node's
/// random draws reproducible.
pub fn spawn_node(
    ether: &Ether,
    address: MacAddress,
    config: MacConfig,
    seed: Option<u64>,
    cancel: CancellationToken,
) -> Result<SimNode, SimError> {
    let channel = MacChannel::new();
    let phy = SimTransceiver::new(address, SIM_CHANNELS.to_vec(), ether.clone(), channel.phy_events());
    phy.spawn_receiver(cancel.clone());

    let rng: RngSource<StdRng> = match seed {
        Some(seed) => RngSource::seeded(seed),
        None => RngSource::from_os()?,
    };
    let engine = Engine::new(config, phy, TxQueue::default(), SystemClock, rng)?;
    let counters = engine.counters();
    let mac = channel.handle();
    let (dispatcher, indications) = Dispatcher::new(engine, channel);
    tokio::spawn(dispatcher.run(cancel));

    info!("simulated node {:02x?} up", address);
    Ok(SimNode {
        address,
        mac,
        indications,
        counters,
    })
}
