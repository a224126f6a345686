//! Traffic manager facade.
//!
//! [`TrafficManager`] is the owned instance the routing pipeline talks to:
//! - [`TrafficManager::inspect`] on every received packet, before mesh-layer
//!   processing, returning whether to continue or stop
//! - [`TrafficManager::alter`] on every packet about to be rebroadcast
//! - [`TrafficManager::run_maintenance`] from a periodic task
//!
//! All cache and counter access goes through one mutex. Replies to NodeInfo
//! requests are handed to [`MeshServices`] after the lock is released.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mesh_traffic_esp32::packet::{MeshPacket, NodeId, PortNum};
//! use mesh_traffic_esp32::traffic::{
//!     DeviceRole, LocalNode, ManualClock, MeshServices, NodeInfo, NodeInfoReply,
//!     ProcessMessage, TrafficConfig, TrafficManager,
//! };
//!
//! struct NoMesh;
//!
//! impl MeshServices for NoMesh {
//!     fn node_info(&self, _node: NodeId) -> Option<NodeInfo> {
//!         None
//!     }
//!     fn send_reply(&self, _reply: NodeInfoReply) -> bool {
//!         false
//!     }
//! }
//!
//! let config = TrafficConfig {
//!     rate_limit_enabled: true,
//!     rate_limit_max_packets: 2,
//!     ..TrafficConfig::enabled()
//! };
//! let local = LocalNode { node: 0x1111_1111, role: DeviceRole::Client };
//! let clock = Arc::new(ManualClock::new(0));
//! let manager = TrafficManager::new(config, local, NoMesh, clock).unwrap();
//!
//! let packet = MeshPacket::decoded(0x2222_2222, 0xFFFF_FFFF, PortNum::TextMessage);
//! assert_eq!(manager.inspect(&packet), ProcessMessage::Continue);
//! assert_eq!(manager.inspect(&packet), ProcessMessage::Continue);
//! assert_eq!(manager.inspect(&packet), ProcessMessage::Stop);
//! assert_eq!(manager.stats().rate_limit_drops, 1);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};

use super::config::{LocalNode, TrafficConfig, TrafficConfigError};
use super::policy::{
    hop_exhaust_reason, is_foreign_nodeinfo_request, is_within_response_range, CacheState,
};
use super::services::{Clock, MeshServices, MonotonicClock, NodeInfoReply};
use super::stats::{bump, TrafficStats};
use crate::packet::{MeshPacket, PortNum};

/// How often [`TrafficManager::run_maintenance`] wants to be called.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Verdict of [`TrafficManager::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMessage {
    /// Hand the packet to the rest of the pipeline.
    Continue,
    /// The packet was dropped or fully handled here.
    Stop,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Records still tracking something.
    pub active: usize,
    /// Records freed in this pass.
    pub expired: usize,
    /// Whether the epoch was rebased (which empties the table).
    pub epoch_reset: bool,
}

/// State behind the lock.
struct Shared {
    cache: CacheState,
    stats: TrafficStats,
}

/// Per-node traffic shaping for a mesh router.
///
/// Generic over the mesh collaborator and the clock so the same code runs
/// on the device and in host replays.
pub struct TrafficManager<M, C = MonotonicClock> {
    config: TrafficConfig,
    local: LocalNode,
    mesh: M,
    clock: C,
    shared: Mutex<Shared>,
    /// Set by `alter` when it exhausted the current packet's hops.
    exhaust_requested: AtomicBool,
    /// Set by `inspect` when it stopped the current packet.
    ignore_request: AtomicBool,
}

impl<M: MeshServices, C: Clock> TrafficManager<M, C> {
    /// Build a manager and allocate its cache.
    ///
    /// # Errors
    ///
    /// Returns [`TrafficConfigError`] if `config` fails validation.
    pub fn new(
        config: TrafficConfig,
        local: LocalNode,
        mesh: M,
        clock: C,
    ) -> Result<Self, TrafficConfigError> {
        config.validate()?;

        let cache = CacheState::new(&config, clock.now_ms());
        info!(
            "Traffic management: enabled={} node=0x{:08x} role={:?} slots={} ({} bytes)",
            config.enabled,
            local.node,
            local.role,
            cache.table().capacity(),
            cache.table().memory_bytes()
        );
        info!(
            "Traffic policies: dedup={} rate={} unknown={} nodeinfo={} exhaust_telemetry={} exhaust_position={}",
            config.position_dedup_enabled,
            config.rate_limit_enabled,
            config.drop_unknown_enabled,
            config.nodeinfo_direct_response,
            config.exhaust_hop_telemetry,
            config.exhaust_hop_position
        );
        let epoch = cache.epoch();
        debug!(
            "Tick resolutions: position={}s rate={}s unknown={}s",
            epoch.position().secs(),
            epoch.rate().secs(),
            epoch.unknown().secs()
        );

        Ok(Self {
            config,
            local,
            mesh,
            clock,
            shared: Mutex::new(Shared {
                cache,
                stats: TrafficStats::default(),
            }),
            exhaust_requested: AtomicBool::new(false),
            ignore_request: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Traffic cache mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    /// Identity of the local node.
    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    /// Judge a received packet.
    ///
    /// Runs the unknown-packet filter, position dedup, rate limiting and
    /// NodeInfo direct response in that order, stopping at the first policy
    /// that drops or handles the packet. Packets from the local node skip
    /// dedup and rate limiting.
    pub fn inspect(&self, packet: &MeshPacket) -> ProcessMessage {
        if !self.config.enabled {
            return ProcessMessage::Continue;
        }

        self.ignore_request.store(false, Ordering::Relaxed);
        self.exhaust_requested.store(false, Ordering::Relaxed);

        let verdict = self.evaluate(packet);
        if verdict == ProcessMessage::Stop {
            self.ignore_request.store(true, Ordering::Relaxed);
        }
        verdict
    }

    fn evaluate(&self, packet: &MeshPacket) -> ProcessMessage {
        let now = self.clock.now_ms();

        {
            let mut guard = self.lock();
            let Shared { cache, stats } = &mut *guard;
            bump(&mut stats.packets_inspected);

            let Some(data) = packet.decoded_data() else {
                if self.config.drop_unknown_enabled
                    && cache.should_drop_unknown(&self.config, packet.from, now)
                {
                    bump(&mut stats.unknown_packet_drops);
                    log_action("drop", packet, "unknown-packet");
                    return ProcessMessage::Stop;
                }
                return ProcessMessage::Continue;
            };

            if packet.from != self.local.node {
                if self.config.position_dedup_enabled && data.port == PortNum::Position {
                    let coordinates = data.position.as_ref().and_then(|p| p.coordinates());
                    if let Some((lat, lon)) = coordinates {
                        if cache.should_drop_position(&self.config, packet.from, lat, lon, now) {
                            bump(&mut stats.position_dedup_drops);
                            log_action("drop", packet, "position-dedup");
                            return ProcessMessage::Stop;
                        }
                    }
                }

                if self.config.rate_limit_enabled
                    && !data.port.is_mesh_control()
                    && cache.is_rate_limited(&self.config, packet.from, now)
                {
                    bump(&mut stats.rate_limit_drops);
                    log_action("drop", packet, "rate-limit");
                    return ProcessMessage::Stop;
                }
            }
        }

        if self.config.nodeinfo_direct_response && self.respond_from_cache(packet) {
            return ProcessMessage::Stop;
        }
        ProcessMessage::Continue
    }

    /// Answer a NodeInfo request on behalf of its target. Called unlocked.
    fn respond_from_cache(&self, packet: &MeshPacket) -> bool {
        if !is_foreign_nodeinfo_request(packet, &self.local) {
            return false;
        }
        if !is_within_response_range(packet, &self.config, self.local.role) {
            return false;
        }
        let Some(user) = self.mesh.node_info(packet.to) else {
            debug!("NodeInfo request for 0x{:08x}: not in node database", packet.to);
            return false;
        };

        let reply = NodeInfoReply {
            from: packet.to,
            to: packet.from,
            channel: packet.channel,
            request_id: packet.id,
            hop_limit: 0,
            hop_start: 0,
            want_response: false,
            next_hop: (packet.from & 0xFF) as u8,
            user,
        };
        if !self.mesh.send_reply(reply) {
            warn!(
                "NodeInfo reply for 0x{:08x} to 0x{:08x} could not be queued",
                packet.to, packet.from
            );
            return false;
        }

        bump(&mut self.lock().stats.nodeinfo_cache_hits);
        log_action("respond", packet, "nodeinfo-cache");
        true
    }

    /// Adjust a packet about to be rebroadcast.
    ///
    /// Exhausts the hop limit of relayed telemetry or position broadcasts
    /// when configured; [`should_exhaust_hops`](Self::should_exhaust_hops)
    /// reports whether this happened.
    pub fn alter(&self, packet: &mut MeshPacket) {
        self.exhaust_requested.store(false, Ordering::Relaxed);
        if !self.config.enabled {
            return;
        }

        let Some(reason) = hop_exhaust_reason(packet, &self.config, &self.local) else {
            return;
        };
        log_action("exhaust", packet, reason);
        packet.hop_limit = 0;
        self.exhaust_requested.store(true, Ordering::Relaxed);
        bump(&mut self.lock().stats.hop_exhausted_packets);
    }

    /// Whether the last packet passed to [`alter`](Self::alter) had its hops
    /// exhausted.
    pub fn should_exhaust_hops(&self) -> bool {
        self.exhaust_requested.load(Ordering::Relaxed)
    }

    /// Whether the last packet passed to [`inspect`](Self::inspect) was
    /// stopped, so the normal request/response flow should ignore it.
    pub fn ignore_request(&self) -> bool {
        self.ignore_request.load(Ordering::Relaxed)
    }

    /// Count a router-to-router relay that kept its hop limit.
    pub fn record_router_hop_preserved(&self) {
        if !self.config.enabled {
            return;
        }
        bump(&mut self.lock().stats.router_hops_preserved);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> TrafficStats {
        self.lock().stats
    }

    /// Zero every counter.
    pub fn reset_stats(&self) {
        self.lock().stats = TrafficStats::default();
    }

    /// Number of nodes currently tracked.
    pub fn tracked_nodes(&self) -> usize {
        self.lock().cache.table().len()
    }

    /// Rebase the epoch if due, otherwise expire stale records.
    pub fn maintain(&self) -> MaintenanceReport {
        let now = self.clock.now_ms();
        let mut guard = self.lock();

        if guard.cache.reset_epoch_if_needed(now) {
            return MaintenanceReport {
                epoch_reset: true,
                ..Default::default()
            };
        }
        let sweep = guard.cache.sweep_expired(&self.config, now);
        MaintenanceReport {
            active: sweep.active,
            expired: sweep.expired,
            epoch_reset: false,
        }
    }

    /// Periodic tick. Returns the delay until the next call.
    pub fn run_maintenance(&self) -> Duration {
        if !self.config.enabled {
            return MAINTENANCE_INTERVAL;
        }

        let report = self.maintain();
        if report.epoch_reset {
            info!("Traffic cache epoch reset");
        } else if report.expired > 0 {
            debug!(
                "Traffic maintenance: {} active, {} expired",
                report.active, report.expired
            );
        }
        MAINTENANCE_INTERVAL
    }
}

fn log_action(action: &str, packet: &MeshPacket, reason: &str) {
    let port = match packet.port() {
        Some(port) => port.to_string(),
        None => String::from("encrypted"),
    };
    info!(
        "{} {} from=0x{:08x} to=0x{:08x} hop={}/{} reason={}",
        action, port, packet.from, packet.to, packet.hop_limit, packet.hop_start, reason
    );
}
