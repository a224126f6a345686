//! Replay a packet capture through the traffic manager.
//!
//! Reads a JSON config and a JSON-lines capture, feeds every packet through
//! `inspect` (inbound) or `alter` (outbound) on a simulated clock, and prints
//! each verdict followed by the final counters.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin traffic-replay -- config.json capture.jsonl [--stats-port 8080]
//! ```
//!
//! Config:
//!
//! ```json
//! {
//!   "local": { "node": 286331153, "role": "router" },
//!   "traffic": { "enabled": true, "rate_limit_enabled": true },
//!   "known_nodes": [ { "num": 858993459, "long_name": "Hilltop", "short_name": "HILL" } ]
//! }
//! ```
//!
//! Capture line:
//!
//! ```json
//! {"at_ms": 1000, "direction": "inbound", "packet": {"from": 572662306, "to": 4294967295,
//!  "hop_start": 3, "hop_limit": 3, "payload": {"decoded": {"port": 1}}}}
//! ```

use log::{error, info, warn};
use mesh_traffic_esp32::network::StatsServer;
use mesh_traffic_esp32::packet::{MeshPacket, NodeId};
use mesh_traffic_esp32::traffic::{
    Clock, LocalNode, ManualClock, MeshServices, NodeInfo, NodeInfoReply, ProcessMessage, TrafficConfig,
    TrafficConfigError, TrafficManager, MAINTENANCE_INTERVAL,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: traffic-replay <config.json> <capture.jsonl> [--stats-port PORT]";

/// Error type for replay runs.
#[derive(Debug)]
enum ReplayError {
    /// Bad command line.
    Usage(String),
    /// Could not read an input file.
    Io(String, std::io::Error),
    /// Malformed JSON in the config or at a capture line.
    Json(String, serde_json::Error),
    /// Rejected traffic configuration.
    Config(TrafficConfigError),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::Usage(msg) => write!(f, "{}\n{}", msg, USAGE),
            ReplayError::Io(path, e) => write!(f, "{}: {}", path, e),
            ReplayError::Json(place, e) => write!(f, "{}: {}", place, e),
            ReplayError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<TrafficConfigError> for ReplayError {
    fn from(e: TrafficConfigError) -> Self {
        ReplayError::Config(e)
    }
}

#[derive(Debug, Deserialize)]
struct ReplayConfig {
    local: LocalNode,
    #[serde(default)]
    traffic: TrafficConfig,
    #[serde(default)]
    known_nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Deserialize)]
struct CaptureRecord {
    at_ms: u64,
    direction: Direction,
    packet: MeshPacket,
}

struct Args {
    config_path: String,
    capture_path: String,
    stats_port: Option<u16>,
}

fn parse_args() -> Result<Args, ReplayError> {
    let mut positional = Vec::new();
    let mut stats_port = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stats-port" => {
                let value = args
                    .next()
                    .ok_or_else(|| ReplayError::Usage("--stats-port needs a value".into()))?;
                let port = value
                    .parse()
                    .map_err(|_| ReplayError::Usage(format!("invalid port: {}", value)))?;
                stats_port = Some(port);
            }
            "-h" | "--help" => return Err(ReplayError::Usage("help requested".into())),
            _ => positional.push(arg),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([config_path, capture_path]) => Ok(Args {
            config_path,
            capture_path,
            stats_port,
        }),
        Err(_) => Err(ReplayError::Usage("expected a config and a capture file".into())),
    }
}

/// Node database built from the config; replies are printed, never sent.
struct ReplayMesh {
    nodes: HashMap<NodeId, NodeInfo>,
    replies: AtomicUsize,
}

impl MeshServices for ReplayMesh {
    fn node_info(&self, node: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&node).cloned()
    }

    fn send_reply(&self, reply: NodeInfoReply) -> bool {
        self.replies.fetch_add(1, Ordering::Relaxed);
        match serde_json::to_string(&reply) {
            Ok(json) => println!("  reply {}", json),
            Err(e) => warn!("Could not serialize reply: {}", e),
        }
        true
    }
}

type ReplayManager = TrafficManager<Arc<ReplayMesh>, Arc<ManualClock>>;

fn load_config(path: &str) -> Result<ReplayConfig, ReplayError> {
    let file = File::open(path).map_err(|e| ReplayError::Io(path.to_string(), e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| ReplayError::Json(path.to_string(), e))
}

fn describe(packet: &MeshPacket) -> String {
    let port = match packet.port() {
        Some(port) => port.to_string(),
        None => String::from("encrypted"),
    };
    format!(
        "0x{:08x} -> 0x{:08x} {} hop={}/{}",
        packet.from, packet.to, port, packet.hop_limit, packet.hop_start
    )
}

/// Feed the capture through the manager, running maintenance on capture time.
fn replay(
    path: &str,
    manager: &ReplayManager,
    clock: &ManualClock,
) -> Result<usize, ReplayError> {
    let file = File::open(path).map_err(|e| ReplayError::Io(path.to_string(), e))?;
    let interval_ms = MAINTENANCE_INTERVAL.as_millis() as u64;
    let mut next_maintenance: Option<u64> = None;
    let mut replayed = 0;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ReplayError::Io(path.to_string(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut record: CaptureRecord = serde_json::from_str(&line)
            .map_err(|e| ReplayError::Json(format!("{}:{}", path, index + 1), e))?;

        let due = next_maintenance.get_or_insert(record.at_ms + interval_ms);
        while record.at_ms >= *due {
            clock.set(*due);
            manager.run_maintenance();
            *due += interval_ms;
        }
        if !clock.set(record.at_ms) {
            warn!(
                "{}:{}: at_ms {} is earlier than the replay clock ({} ms), replaying at the later time",
                path,
                index + 1,
                record.at_ms,
                clock.now_ms()
            );
        }

        match record.direction {
            Direction::Inbound => {
                let verdict = match manager.inspect(&record.packet) {
                    ProcessMessage::Continue => "CONTINUE",
                    ProcessMessage::Stop => "STOP",
                };
                println!("{:>10} in  {} => {}", record.at_ms, describe(&record.packet), verdict);
            }
            Direction::Outbound => {
                let before = describe(&record.packet);
                manager.alter(&mut record.packet);
                let outcome = if manager.should_exhaust_hops() {
                    "EXHAUSTED"
                } else {
                    "unchanged"
                };
                println!("{:>10} out {} => {}", record.at_ms, before, outcome);
            }
        }
        replayed += 1;
    }

    Ok(replayed)
}

fn run() -> Result<(), ReplayError> {
    let args = parse_args()?;
    let config = load_config(&args.config_path)?;

    let mesh = Arc::new(ReplayMesh {
        nodes: config
            .known_nodes
            .into_iter()
            .map(|info| (info.num, info))
            .collect(),
        replies: AtomicUsize::new(0),
    });
    let clock = Arc::new(ManualClock::new(0));
    let manager = Arc::new(TrafficManager::new(
        config.traffic,
        config.local,
        mesh.clone(),
        clock.clone(),
    )?);

    let replayed = replay(&args.capture_path, &manager, &clock)?;
    info!(
        "Replayed {} packets, {} replies, {} nodes tracked",
        replayed,
        mesh.replies.load(Ordering::Relaxed),
        manager.tracked_nodes()
    );

    match serde_json::to_string_pretty(&manager.stats()) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Could not serialize stats: {}", e),
    }

    if let Some(port) = args.stats_port {
        let _server = StatsServer::start(None, port, manager.clone())
            .map_err(|e| ReplayError::Io(format!("stats server port {}", port), e))?;
        info!("Serving final stats at http://localhost:{}/stats (Ctrl+C to exit)", port);
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }

    Ok(())
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}
