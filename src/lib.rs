//! SRFN radio mesh MAC layer.
//!
//! The [`mac`] module holds the CSMA/CA engine and everything it needs;
//! [`sim`] runs it against a simulated medium and [`stats`] serves its
//! counters over HTTP.

pub mod mac;
pub mod sim;
pub mod stats;
#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use mac::{
    Confirmation, DataRequest, Destination, Dispatcher, Engine, Indication, MacChannel,
    MacConfig, MacHandle, Request, RequestKind,
};
pub use stats::{MacCounters, StatsServer, DEFAULT_STATS_PORT};
