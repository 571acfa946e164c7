//! Async front end for the [`Engine`].
//!
//! Every input to the MAC (upstream requests, transceiver confirmations,
//! received frames, synthetic confirmations and control calls) is posted as a
//! [`MacEvent`] onto one unbounded channel. [`Dispatcher::run`] drains it on a
//! single task, so the engine never sees two events at once. Between events
//! the loop sleeps until the engine's next deadline and then polls it.
//!
//! # Example
//!
//! ```no_run
//! use srfn_mac::mac::{
//!     DataRequest, Destination, Dispatcher, Engine, MacChannel, MacConfig, RequestKind,
//!     RngSource, SystemClock, TxQueue,
//! };
//! use tokio_util::sync::CancellationToken;
//! # async fn run(phy: impl srfn_mac::mac::Transceiver + Send + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! let channel = MacChannel::new();
//! let mac = channel.handle();
//! let engine = Engine::new(MacConfig::default(), phy, TxQueue::default(), SystemClock, RngSource::from_os()?)?;
//! let (dispatcher, mut indications) = Dispatcher::new(engine, channel);
//! tokio::spawn(dispatcher.run(CancellationToken::new()));
//!
//! mac.submit(RequestKind::Start).await?;
//! let confirmation = mac
//!     .submit(RequestKind::Data(DataRequest::new(Destination::Broadcast, b"hi".to_vec())))
//!     .await?;
//! println!("{:?}", confirmation);
//! while let Some(indication) = indications.recv().await {
//!     println!("{:?}", indication);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::engine::Engine;
use super::frames::FrameManager;
use super::phy::{PhyConfirm, PhyError, RxIndication, Transceiver};
use super::primitives::{
    Confirmation, DataStatus, Handle, Indication, MacAddress, Request, RequestKind,
    TimePushStatus, TimeQueryStatus,
};
use super::random::RandomSource;
use super::supervisor::SyntheticConfirm;
use super::time_sync::{PushMode, TimeAuthority};
use super::timers::Clock;

/// Longest the loop sleeps without polling the engine.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(500);

/// One input to the MAC.
#[derive(Debug)]
pub enum MacEvent {
    Request(Request, oneshot::Sender<Confirmation>),
    Phy(PhyConfirm),
    Indication(RxIndication),
    Synthetic(SyntheticConfirm),
    TimePush {
        mode: PushMode,
        origin: Option<MacAddress>,
        diversity_ms: u32,
        reply: oneshot::Sender<TimePushStatus>,
    },
    PauseTx(bool),
    SetThrottle(u32),
    SuspendThrottle(u8),
    SetTimeAuthority(TimeAuthority),
}

/// The MAC event loop went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    Closed,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "MAC dispatcher is not running"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Event queue feeding a [`Dispatcher`]. Hand out senders before passing it
/// to [`Dispatcher::new`].
pub struct MacChannel {
    tx: mpsc::UnboundedSender<MacEvent>,
    rx: mpsc::UnboundedReceiver<MacEvent>,
    next_handle: Arc<AtomicU16>,
}

impl MacChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            next_handle: Arc::new(AtomicU16::new(1)),
        }
    }

    /// Sender for upper layers.
    pub fn handle(&self) -> MacHandle {
        MacHandle {
            tx: self.tx.clone(),
            next_handle: Arc::clone(&self.next_handle),
        }
    }

    /// Sender for the transceiver driver.
    pub fn phy_events(&self) -> PhyEvents {
        PhyEvents {
            tx: self.tx.clone(),
        }
    }
}

impl Default for MacChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper-layer access to a running MAC.
#[derive(Debug, Clone)]
pub struct MacHandle {
    tx: mpsc::UnboundedSender<MacEvent>,
    next_handle: Arc<AtomicU16>,
}

impl MacHandle {
    /// Submit a request under a fresh handle and wait for its confirmation.
    pub async fn submit(&self, kind: RequestKind) -> Result<Confirmation, DispatchError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.submit_request(Request { handle, kind }).await
    }

    /// Submit a request with a caller-chosen handle.
    pub async fn submit_request(&self, request: Request) -> Result<Confirmation, DispatchError> {
        let (reply, confirmation) = oneshot::channel();
        self.send(MacEvent::Request(request, reply))?;
        confirmation.await.map_err(|_| DispatchError::Closed)
    }

    pub async fn push_time(
        &self,
        mode: PushMode,
        origin: Option<MacAddress>,
        diversity_ms: u32,
    ) -> Result<TimePushStatus, DispatchError> {
        let (reply, status) = oneshot::channel();
        self.send(MacEvent::TimePush {
            mode,
            origin,
            diversity_ms,
            reply,
        })?;
        status.await.map_err(|_| DispatchError::Closed)
    }

    pub fn pause_tx(&self, paused: bool) -> Result<(), DispatchError> {
        self.send(MacEvent::PauseTx(paused))
    }

    pub fn set_tx_throttle(&self, budget: u32) -> Result<(), DispatchError> {
        self.send(MacEvent::SetThrottle(budget))
    }

    pub fn suspend_throttle(&self, hours: u8) -> Result<(), DispatchError> {
        self.send(MacEvent::SuspendThrottle(hours))
    }

    pub fn set_time_authority(&self, authority: TimeAuthority) -> Result<(), DispatchError> {
        self.send(MacEvent::SetTimeAuthority(authority))
    }

    fn send(&self, event: MacEvent) -> Result<(), DispatchError> {
        self.tx.send(event).map_err(|_| DispatchError::Closed)
    }
}

/// Transceiver-side access to a running MAC.
#[derive(Debug, Clone)]
pub struct PhyEvents {
    tx: mpsc::UnboundedSender<MacEvent>,
}

impl PhyEvents {
    pub fn confirm(&self, confirm: PhyConfirm) -> Result<(), PhyError> {
        self.tx
            .send(MacEvent::Phy(confirm))
            .map_err(|_| PhyError::Disconnected)
    }

    pub fn indication(&self, rx: RxIndication) -> Result<(), PhyError> {
        self.tx
            .send(MacEvent::Indication(rx))
            .map_err(|_| PhyError::Disconnected)
    }
}

/// Failure answer for a deferred request whose handle is already awaiting a
/// confirmation. Requests answered on the spot need none.
fn duplicate_rejection(request: &Request) -> Option<Confirmation> {
    let handle = request.handle;
    match request.kind {
        RequestKind::Data(_) => Some(Confirmation::Data {
            handle,
            status: DataStatus::InvalidParameter,
        }),
        RequestKind::Ping(_) => Some(Confirmation::Ping {
            handle,
            status: DataStatus::InvalidParameter,
        }),
        RequestKind::TimeQuery => Some(Confirmation::TimeQuery {
            handle,
            status: TimeQueryStatus::TransactionFailed,
        }),
        _ => None,
    }
}

enum Wake {
    Cancelled,
    Event(Option<MacEvent>),
    Deadline,
}

/// Single-task owner of an [`Engine`].
pub struct Dispatcher<P, F, C, R> {
    engine: Engine<P, F, C, R>,
    rx: mpsc::UnboundedReceiver<MacEvent>,
    loopback: mpsc::UnboundedSender<MacEvent>,
    indications: mpsc::UnboundedSender<Indication>,
    pending: HashMap<Handle, oneshot::Sender<Confirmation>>,
}

impl<P, F, C, R> Dispatcher<P, F, C, R>
where
    P: Transceiver,
    F: FrameManager,
    C: Clock,
    R: RandomSource,
{
    /// Returns the dispatcher and the receiver for indications.
    pub fn new(
        engine: Engine<P, F, C, R>,
        channel: MacChannel,
    ) -> (Self, mpsc::UnboundedReceiver<Indication>) {
        let (indications, indication_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            engine,
            rx: channel.rx,
            loopback: channel.tx,
            indications,
            pending: HashMap::new(),
        };
        (dispatcher, indication_rx)
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("MAC dispatcher started");
        loop {
            let wait = self
                .engine
                .next_deadline()
                .map_or(MAX_IDLE_WAIT, |deadline| {
                    deadline
                        .saturating_duration_since(self.engine.now())
                        .min(MAX_IDLE_WAIT)
                });

            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = self.rx.recv() => Wake::Event(event),
                _ = tokio::time::sleep(wait) => Wake::Deadline,
            };

            match wake {
                Wake::Cancelled => {
                    debug!("MAC dispatcher shutting down");
                    break;
                }
                Wake::Event(Some(event)) => self.handle_event(event),
                Wake::Event(None) => {
                    debug!("MAC event channel closed");
                    break;
                }
                Wake::Deadline => {}
            }
            self.housekeeping();
        }
        info!("MAC dispatcher stopped");
    }

    fn handle_event(&mut self, event: MacEvent) {
        match event {
            MacEvent::Request(request, reply) => {
                let handle = request.handle;
                if self.pending.contains_key(&handle) {
                    if let Some(rejection) = duplicate_rejection(&request) {
                        warn!("handle {} reused while still pending", handle);
                        let _ = reply.send(rejection);
                        return;
                    }
                }
                match self.engine.handle_request(request) {
                    Some(confirmation) => {
                        let _ = reply.send(confirmation);
                    }
                    None => {
                        self.pending.insert(handle, reply);
                    }
                }
            }
            MacEvent::Phy(confirm) => {
                let confirmation = self.engine.handle_phy_confirm(confirm);
                self.deliver(confirmation);
            }
            MacEvent::Synthetic(synthetic) => {
                let confirmation = self.engine.handle_synthetic(synthetic);
                self.deliver(confirmation);
            }
            MacEvent::Indication(rx) => {
                if let Some(indication) = self.engine.handle_indication(rx) {
                    if self.indications.send(indication).is_err() {
                        debug!("indication dropped, nobody listening");
                    }
                }
            }
            MacEvent::TimePush {
                mode,
                origin,
                diversity_ms,
                reply,
            } => {
                let _ = reply.send(self.engine.push_time(mode, origin, diversity_ms));
            }
            MacEvent::PauseTx(paused) => self.engine.pause_tx(paused),
            MacEvent::SetThrottle(budget) => self.engine.set_tx_throttle(budget),
            MacEvent::SuspendThrottle(hours) => self.engine.suspend_throttle(hours),
            MacEvent::SetTimeAuthority(authority) => self.engine.set_time_authority(authority),
        }
    }

    fn housekeeping(&mut self) {
        for confirmation in self.engine.poll() {
            self.deliver(Some(confirmation));
        }
        while let Some(synthetic) = self.engine.take_synthetic() {
            if self.loopback.send(MacEvent::Synthetic(synthetic)).is_err() {
                warn!("synthetic confirmation lost");
            }
        }
    }

    fn deliver(&mut self, confirmation: Option<Confirmation>) {
        let Some(confirmation) = confirmation else {
            return;
        };
        match self.pending.remove(&confirmation.handle()) {
            Some(reply) => {
                let _ = reply.send(confirmation);
            }
            None => warn!("confirmation for unknown handle: {:?}", confirmation),
        }
    }
}
