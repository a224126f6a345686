//! Host-side network surfaces.
//!
//! - [`StatsServer`]: `tiny_http` endpoint serving [`TrafficStats`](crate::traffic::TrafficStats)

mod stats_server;

pub use stats_server::{StatsServer, StatsSource, DEFAULT_STATS_PORT};
