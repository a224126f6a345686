//! Per-node traffic shaping and dedup cache.
//!
//! This module provides:
//! - [`TrafficManager`]: the inspect/alter facade with counters and maintenance
//! - [`CuckooTable`]: fixed-size cuckoo hash table of 10-byte node records
//! - [`CacheEpoch`]: 8-bit adaptive timestamps relative to a shared epoch
//! - [`fingerprint_position`]: lossy 8-bit position token
//! - [`TrafficConfig`]: policy switches and limits

mod config;
mod cuckoo;
mod entry;
mod fingerprint;
mod manager;
mod policy;
mod services;
mod stats;
mod timestamp;

pub use config::{DeviceRole, LocalNode, TrafficConfig, TrafficConfigError, DEFAULT_UNKNOWN_WINDOW_SECS};
pub use cuckoo::{CuckooTable, MAX_CUCKOO_KICKS, MAX_TABLE_SLOTS};
pub use entry::{CacheEntry, EncodedEntry, ENTRY_SIZE};
pub use fingerprint::{fingerprint_position, position_fingerprint, truncate_lat_lon};
pub use manager::{MaintenanceReport, ProcessMessage, TrafficManager, MAINTENANCE_INTERVAL};
pub use policy::{nodeinfo_max_hops, CLIENT_MAX_HOPS, ROUTER_MAX_HOPS};
pub use services::{Clock, ManualClock, MeshServices, MonotonicClock, NodeInfo, NodeInfoReply};
pub use stats::TrafficStats;
pub use timestamp::{CacheEpoch, TickResolution};
