//! Traffic management configuration.
//!
//! Configuration is read once when the [`TrafficManager`](super::TrafficManager)
//! is built; tick resolutions and the table size derive from it, so changes
//! take effect only through a new manager (on the device: a reboot).

use serde::{Deserialize, Serialize};

use super::cuckoo::MAX_TABLE_SLOTS;
use crate::packet::NodeId;

/// Window used for unknown-packet counting when no rate window is configured.
pub const DEFAULT_UNKNOWN_WINDOW_SECS: u32 = 60;

/// Device role of the local node, as far as traffic management cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Regular companion-app node.
    #[default]
    Client,
    /// Client that does not rebroadcast.
    ClientMute,
    /// Client that hides itself from the node list.
    ClientHidden,
    /// Client acting as a base for a small fleet; treated like a router.
    ClientBase,
    /// Infrastructure router.
    Router,
    /// Router that rebroadcasts only after other routers had a chance.
    RouterLate,
    /// Repeater without node identity.
    Repeater,
    /// Position tracker.
    Tracker,
    /// Telemetry sensor.
    Sensor,
}

impl DeviceRole {
    /// Roles allowed to answer NodeInfo requests from several hops away.
    pub fn is_router(&self) -> bool {
        matches!(self, Self::Router | Self::RouterLate | Self::ClientBase)
    }
}

/// Identity of the node running the traffic manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    /// Our own node id; packets from it bypass dedup and rate limiting.
    pub node: NodeId,
    /// Our device role.
    #[serde(default)]
    pub role: DeviceRole,
}

/// Configuration for traffic management.
///
/// Note: This is `Copy` for efficient passing to constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Master switch. When off, both hooks are no-ops.
    pub enabled: bool,
    /// Nominal number of tracked nodes (rounded up to a power of two).
    pub cache_size: usize,

    /// Drop undecodable packets from nodes that keep sending them.
    pub drop_unknown_enabled: bool,
    /// Undecodable packets per window tolerated before dropping.
    pub unknown_packet_threshold: u32,

    /// Drop repeated position reports that did not move.
    pub position_dedup_enabled: bool,
    /// Significant bits kept from each coordinate (0 disables truncation).
    pub position_precision_bits: u32,
    /// Minimum seconds between accepted identical positions (0 never drops).
    pub position_min_interval_secs: u32,

    /// Throttle chatty nodes.
    pub rate_limit_enabled: bool,
    /// Rate-limit window in seconds.
    pub rate_limit_window_secs: u32,
    /// Packets per window before dropping.
    pub rate_limit_max_packets: u32,

    /// Answer NodeInfo requests from the local node database.
    pub nodeinfo_direct_response: bool,
    /// Hop limit for direct responses (0 = role default; clamped by role).
    pub nodeinfo_direct_response_max_hops: u32,

    /// Stop relayed telemetry broadcasts after the next hop.
    pub exhaust_hop_telemetry: bool,
    /// Stop relayed position broadcasts after the next hop.
    pub exhaust_hop_position: bool,
    /// Keep hop_limit on router-to-router relays (applied by the router;
    /// reported via [`TrafficManager::record_router_hop_preserved`](super::TrafficManager::record_router_hop_preserved)).
    pub router_preserve_hops: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_size: 1000,
            drop_unknown_enabled: false,
            unknown_packet_threshold: 5,
            position_dedup_enabled: false,
            position_precision_bits: 16,
            position_min_interval_secs: 300, // 5 minutes
            rate_limit_enabled: false,
            rate_limit_window_secs: 60,
            rate_limit_max_packets: 30,
            nodeinfo_direct_response: false,
            nodeinfo_direct_response_max_hops: 0,
            exhaust_hop_telemetry: false,
            exhaust_hop_position: false,
            router_preserve_hops: false,
        }
    }
}

impl TrafficConfig {
    /// Default configuration with the master switch on and every policy off.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Validate configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `cache_size` is 0
    /// - `cache_size` exceeds the largest supported table
    pub fn validate(&self) -> Result<(), TrafficConfigError> {
        if self.cache_size == 0 {
            return Err(TrafficConfigError::InvalidConfig(
                "cache_size must be greater than 0",
            ));
        }
        if self.cache_size > MAX_TABLE_SLOTS {
            return Err(TrafficConfigError::InvalidConfig(
                "cache_size must be at most 32768",
            ));
        }
        Ok(())
    }

    /// Coordinate precision, clamped to the 32 bits a coordinate has.
    pub fn precision_bits(&self) -> u8 {
        self.position_precision_bits.min(32) as u8
    }

    /// Window over which undecodable packets are counted.
    pub fn unknown_window_secs(&self) -> u32 {
        if self.rate_limit_window_secs > 0 {
            self.rate_limit_window_secs
        } else {
            DEFAULT_UNKNOWN_WINDOW_SECS
        }
    }

    /// Rate-limit threshold as it applies to an 8-bit counter.
    pub fn rate_limit_threshold(&self) -> u8 {
        self.rate_limit_max_packets.min(u32::from(u8::MAX)) as u8
    }

    /// Unknown-packet threshold as it applies to an 8-bit counter.
    pub fn unknown_threshold(&self) -> u8 {
        self.unknown_packet_threshold.min(u32::from(u8::MAX)) as u8
    }
}

/// Error type for traffic configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficConfigError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for TrafficConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for TrafficConfigError {}
