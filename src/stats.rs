//! MAC counters and the HTTP stats server.
//!
//! Counters are bumped by the engine as a side effect of channel access and
//! read concurrently by the stats server thread. Nothing in the engine's
//! control flow reads them back.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "mac": {
//!     "channel_access_failures": 2,
//!     "tx_frames": 150,
//!     "tx_link_delay_count": 1,
//!     "tx_link_delay_time_ms": 250,
//!     "throttle_remaining": 20480,
//!     ...
//!   }
//! }
//! ```

use log::{error, info, warn};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Counters exported for observability.
#[derive(Debug, Default)]
pub struct MacCounters {
    /// Transactions failed because CSMA attempts ran out.
    pub channel_access_failures: AtomicU32,
    /// Frames confirmed as transmitted by the transceiver.
    pub tx_frames: AtomicU32,
    /// Transmissions postponed by a busy or overheated transmitter.
    pub tx_link_delay_count: AtomicU32,
    /// Total postponement requested by the transmitter.
    pub tx_link_delay_time_ms: AtomicU32,
    pub tx_failed: AtomicU32,
    pub transaction_overflows: AtomicU32,
    pub transaction_timeouts: AtomicU32,
    pub rx_frames: AtomicU32,
    pub malformed_commands: AtomicU32,
    pub synthetic_confirms: AtomicU32,
    pub phy_restarts: AtomicU32,
    /// Gauge: bytes left in the current throttle interval.
    pub throttle_remaining: AtomicU32,
    /// Gauge: transactions waiting in the queue.
    pub queue_depth: AtomicU32,
}

/// Point-in-time copy of [`MacCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub channel_access_failures: u32,
    pub tx_frames: u32,
    pub tx_link_delay_count: u32,
    pub tx_link_delay_time_ms: u32,
    pub tx_failed: u32,
    pub transaction_overflows: u32,
    pub transaction_timeouts: u32,
    pub rx_frames: u32,
    pub malformed_commands: u32,
    pub synthetic_confirms: u32,
    pub phy_restarts: u32,
    pub throttle_remaining: u32,
    pub queue_depth: u32,
}

impl MacCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU32, amount: u32) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU32, value: u32) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Zero every counter. Gauges are left alone.
    pub fn reset(&self) {
        for counter in [
            &self.channel_access_failures,
            &self.tx_frames,
            &self.tx_link_delay_count,
            &self.tx_link_delay_time_ms,
            &self.tx_failed,
            &self.transaction_overflows,
            &self.transaction_timeouts,
            &self.rx_frames,
            &self.malformed_commands,
            &self.synthetic_confirms,
            &self.phy_restarts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        CounterSnapshot {
            channel_access_failures: load(&self.channel_access_failures),
            tx_frames: load(&self.tx_frames),
            tx_link_delay_count: load(&self.tx_link_delay_count),
            tx_link_delay_time_ms: load(&self.tx_link_delay_time_ms),
            tx_failed: load(&self.tx_failed),
            transaction_overflows: load(&self.transaction_overflows),
            transaction_timeouts: load(&self.transaction_timeouts),
            rx_frames: load(&self.rx_frames),
            malformed_commands: load(&self.malformed_commands),
            synthetic_confirms: load(&self.synthetic_confirms),
            phy_restarts: load(&self.phy_restarts),
            throttle_remaining: load(&self.throttle_remaining),
            queue_depth: load(&self.queue_depth),
        }
    }
}

#[derive(Serialize)]
struct StatsDocument {
    uptime_secs: u64,
    mac: CounterSnapshot,
}

/// JSON body served on `/stats`.
pub fn stats_json(counters: &MacCounters, started: Instant) -> String {
    let doc = StatsDocument {
        uptime_secs: started.elapsed().as_secs(),
        mac: counters.snapshot(),
    };
    serde_json::to_string(&doc).unwrap_or_else(|e| {
        error!("Failed to serialize stats: {}", e);
        String::from("{}")
    })
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

/// HTTP stats server.
///
/// Runs in a background thread and serves MAC counters as JSON.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start serving `counters` on `bind_addr:port` (all interfaces when
    /// `bind_addr` is `None`). Drop the returned handle to stop.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        counters: Arc<MacCounters>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::run_server(server, counters, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_server(server: Server, counters: Arc<MacCounters>, shutdown: Arc<AtomicBool>) {
        let started = Instant::now();
        let (Some(content_type), Some(allow_get)) = (
            header("Content-Type", "application/json"),
            header("Allow", "GET"),
        ) else {
            error!("Stats server headers rejected");
            return;
        };

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => {
                    if request.method() != &Method::Get {
                        let response = Response::from_string("Method Not Allowed")
                            .with_status_code(405)
                            .with_header(allow_get.clone());
                        let _ = request.respond(response);
                        continue;
                    }

                    let response = match request.url() {
                        "/stats" | "/stats/" => {
                            Response::from_string(stats_json(&counters, started))
                                .with_header(content_type.clone())
                                .with_status_code(200)
                        }
                        _ => Response::from_string("Not Found").with_status_code(404),
                    };
                    if let Err(e) = request.respond(response) {
                        warn!("Failed to send response: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            }
        }
    }

    /// Stop the server. May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}
