//! Mesh traffic management library.
//!
//! Platform-independent traffic shaping for a LoRa mesh router: a compact
//! per-node cache with position dedup, rate limiting, unknown-packet
//! filtering, direct NodeInfo responses and hop exhaustion. Everything here
//! can be tested on the host machine without radio hardware.

pub mod network;
pub mod packet;
pub mod traffic;

// Re-export commonly used items
pub use packet::{MeshPacket, NodeId, PortNum, BROADCAST_ADDR};
pub use traffic::{
    LocalNode, MeshServices, ProcessMessage, TrafficConfig, TrafficConfigError, TrafficManager,
    TrafficStats,
};
