//! Two simulated SRFN nodes sharing one medium.
//!
//! Run with `cargo run --bin node [config.json]`. The optional JSON file
//! overrides [`MacConfig`] fields for both nodes. Node A is a gateway and
//! time source; node B sends it periodic data and pings.
//!
//! ## Endpoints
//!
//! - Stats (node A): http://localhost:8080/stats

use log::{error, info, warn};
use srfn_mac::mac::{
    ChannelSetIndex, DataRequest, Destination, Indication, MacAddress, MacConfig, MacHandle,
    PingRequest, PushMode, Reliability, RequestKind, TimeAuthority, TimeRole,
};
use srfn_mac::sim::{self, Ether, SimNode};
use srfn_mac::{StatsServer, DEFAULT_STATS_PORT};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const NODE_A: MacAddress = [0x00, 0x07, 0x81, 0x00, 0x0A];
const NODE_B: MacAddress = [0x00, 0x07, 0x81, 0x00, 0x0B];

/// How often node B sends traffic.
const TRAFFIC_INTERVAL: Duration = Duration::from_secs(5);

fn load_config() -> Result<MacConfig, String> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(MacConfig::default());
    };
    let text = std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path, e))?;
    let config = MacConfig::from_json(&text).map_err(|e| format!("{}: {}", path, e))?;
    config.validate().map_err(|e| format!("{}: {}", path, e))?;
    info!("Loaded MAC configuration from {}", path);
    Ok(config)
}

fn log_indications(name: &'static str, mut indications: mpsc::UnboundedReceiver<Indication>) {
    tokio::spawn(async move {
        while let Some(indication) = indications.recv().await {
            match indication {
                Indication::Data { src, payload, rssi_dbm } => info!(
                    "[{}] data from {:02x?}: {} bytes at {} dBm",
                    name,
                    src,
                    payload.len(),
                    rssi_dbm
                ),
                Indication::TimeSet { src, .. } => info!("[{}] time set from {:02x?}", name, src),
                Indication::PingResponse { src, response } => info!(
                    "[{}] ping response from {:02x?}: count {}",
                    name, src, response.ping_count
                ),
                Indication::LinkParameters { src, params } => {
                    info!("[{}] link parameters from {:02x?}: {:?}", name, src, params)
                }
            }
        }
    });
}

async fn run_traffic(gateway: MacAddress, a: MacHandle, b: MacHandle, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TRAFFIC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sequence: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sequence = sequence.wrapping_add(1);

        let mut request = DataRequest::new(
            Destination::Unicast(gateway),
            format!("reading {}", sequence).into_bytes(),
        );
        request.reliability = Reliability::Medium;
        match b.submit(RequestKind::Data(request)).await {
            Ok(confirmation) => info!("[B] {:?}", confirmation),
            Err(e) => {
                error!("[B] {}", e);
                break;
            }
        }

        if sequence % 3 == 0 {
            let ping = PingRequest {
                dst: Destination::Unicast(gateway),
                priority: 7,
                reliability: Reliability::Low,
                channel_set_index: ChannelSetIndex::Any,
                counter_reset: false,
                unicast_response: true,
            };
            match b.submit(RequestKind::Ping(ping)).await {
                Ok(confirmation) => info!("[B] {:?}", confirmation),
                Err(e) => warn!("[B] ping: {}", e),
            }
        }

        if sequence % 4 == 0 {
            match a.push_time(PushMode::Broadcast, None, 0).await {
                Ok(status) => info!("[A] time push: {:?}", status),
                Err(e) => warn!("[A] time push: {}", e),
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== SRFN MAC simulation starting ===");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let ether = Ether::new(config.throttle.bit_rate);

    let gateway_config = MacConfig {
        gateway: true,
        ..config.clone()
    };
    let nodes = sim::spawn_node(&ether, NODE_A, gateway_config, None, cancel.clone()).and_then(
        |a| sim::spawn_node(&ether, NODE_B, config, None, cancel.clone()).map(|b| (a, b)),
    );
    let (a, b) = match nodes {
        Ok(nodes) => nodes,
        Err(e) => {
            error!("Failed to start nodes: {}", e);
            std::process::exit(1);
        }
    };
    let SimNode {
        address: a_address,
        mac: a_mac,
        indications: a_indications,
        counters: a_counters,
    } = a;
    let SimNode {
        mac: b_mac,
        indications: b_indications,
        ..
    } = b;

    let _stats_server = match StatsServer::start(None, DEFAULT_STATS_PORT, a_counters) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start stats server: {}", e);
            None
        }
    };

    for (name, mac) in [("A", &a_mac), ("B", &b_mac)] {
        if let Err(e) = mac.submit(RequestKind::Start).await {
            error!("[{}] start failed: {}", name, e);
            std::process::exit(1);
        }
    }
    let authority = TimeAuthority {
        role: TimeRole::Source,
        time_valid: true,
    };
    if let Err(e) = a_mac.set_time_authority(authority) {
        warn!("[A] {}", e);
    }

    log_indications("A", a_indications);
    log_indications("B", b_indications);

    let traffic = tokio::spawn(run_traffic(a_address, a_mac, b_mac, cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        result = traffic => {
            if let Err(e) = result {
                error!("Traffic task error: {}", e);
            }
        }
    }
    cancel.cancel();
    info!("=== SRFN MAC simulation stopped ===");
}
