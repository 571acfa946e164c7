//! Interface to the physical-layer transceiver.
//!
//! The transceiver accepts requests synchronously (accepted or rejected) and
//! reports their outcome later as a [`PhyConfirm`] posted to the dispatcher.
//! Received frames arrive the same way as [`RxIndication`]s.

use super::commands::NetTime;
use super::primitives::{Destination, MacAddress};

/// Radio channel number.
pub type Channel = u16;

/// Framing variant of a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Mesh framing (preamble, sync, header, FEC).
    Srfn,
    /// Legacy STAR framing.
    Star,
}

impl Framing {
    /// Bytes added on air on top of the frame payload.
    pub fn overhead(self) -> u32 {
        match self {
            // preamble 24 + sync 8 + header 8 + FEC/CRC 16
            Self::Srfn => 56,
            Self::Star => 17,
        }
    }
}

/// Timing constraint passed with a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxConstraint {
    /// Transmit as soon as possible.
    Regular,
    /// Transmit deterministically so the payload timestamp stays exact.
    Exact,
}

/// A frame handed to the transceiver.
#[derive(Debug, Clone, Copy)]
pub struct PhyDataRequest<'a> {
    pub channel: Channel,
    /// Header fields for the frame encoder.
    pub dst: Destination,
    pub is_command: bool,
    pub payload: &'a [u8],
    pub framing: Framing,
    pub constraint: TxConstraint,
}

/// Status of a clear-channel assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcaStatus {
    Success,
    ServiceUnavailable,
    Busy,
}

/// Status of a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyDataStatus {
    Success,
    ServiceUnavailable,
    TransmissionFailed,
    InvalidParameter,
    /// Transmitter busy; retry after the supplied delay.
    Busy,
    /// Transmitter too hot; retry after the supplied delay.
    ThermalOverride,
    Aborted,
}

/// Status of a transceiver reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    Success,
    Failure,
}

/// Which confirmation is being waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmKind {
    Cca,
    Data,
    Reset,
}

/// Asynchronous outcome of a transceiver request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyConfirm {
    Cca { status: CcaStatus, clear: bool },
    Data { status: PhyDataStatus, delay_ms: u32 },
    Reset { status: ResetStatus },
}

impl PhyConfirm {
    pub fn kind(&self) -> ConfirmKind {
        match self {
            Self::Cca { .. } => ConfirmKind::Cca,
            Self::Data { .. } => ConfirmKind::Data,
            Self::Reset { .. } => ConfirmKind::Reset,
        }
    }

    /// Failure confirmation used when the real one never arrives.
    pub fn failure(kind: ConfirmKind) -> Self {
        match kind {
            ConfirmKind::Cca => Self::Cca {
                status: CcaStatus::ServiceUnavailable,
                clear: false,
            },
            ConfirmKind::Data => Self::Data {
                status: PhyDataStatus::TransmissionFailed,
                delay_ms: 0,
            },
            ConfirmKind::Reset => Self::Reset {
                status: ResetStatus::Failure,
            },
        }
    }
}

/// A decoded frame received by the transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxIndication {
    pub src: MacAddress,
    /// Command frames carry a MAC command; data frames go to the upper layer.
    pub is_command: bool,
    pub payload: Vec<u8>,
    pub rssi_dbm: i16,
    pub channel: Channel,
    /// Network time the frame was received, stamped by the transceiver.
    pub rx_time: NetTime,
}

/// Reasons a transceiver refuses a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyError {
    /// Transceiver is not in a state to accept requests.
    NotReady,
    /// Request parameters were rejected.
    InvalidParameter(&'static str),
    /// Event channel towards the MAC is closed.
    Disconnected,
}

impl std::fmt::Display for PhyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "transceiver not ready"),
            Self::InvalidParameter(msg) => write!(f, "invalid transceiver parameter: {}", msg),
            Self::Disconnected => write!(f, "transceiver event channel closed"),
        }
    }
}

impl std::error::Error for PhyError {}

/// Physical-layer transceiver driven by the channel-access engine.
pub trait Transceiver {
    /// Channels currently usable for transmission.
    fn tx_channels(&self) -> Vec<Channel>;

    /// Start a clear-channel assessment; completes with [`PhyConfirm::Cca`].
    fn cca_request(&mut self, channel: Channel) -> Result<(), PhyError>;

    /// Start a transmission; completes with [`PhyConfirm::Data`].
    fn data_request(&mut self, request: &PhyDataRequest<'_>) -> Result<(), PhyError>;

    /// Restart the radio; completes with [`PhyConfirm::Reset`].
    fn reset_request(&mut self) -> Result<(), PhyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_confirm_matches_kind() {
        for kind in [ConfirmKind::Cca, ConfirmKind::Data, ConfirmKind::Reset] {
            assert_eq!(PhyConfirm::failure(kind).kind(), kind);
        }
    }

    #[test]
    fn test_synthetic_cca_failure_is_busy() {
        assert!(matches!(
            PhyConfirm::failure(ConfirmKind::Cca),
            PhyConfirm::Cca {
                status: CcaStatus::ServiceUnavailable,
                clear: false
            }
        ));
    }
}
