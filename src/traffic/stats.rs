//! Traffic management counters.

use serde::{Deserialize, Serialize};

/// Snapshot of the traffic manager's counters.
///
/// Counters only grow (saturating at `u32::MAX`) until reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Packets passed to `inspect` while enabled.
    pub packets_inspected: u32,
    /// Position reports dropped as duplicates.
    pub position_dedup_drops: u32,
    /// Packets dropped by the per-node rate limit.
    pub rate_limit_drops: u32,
    /// Undecodable packets dropped from repeat offenders.
    pub unknown_packet_drops: u32,
    /// NodeInfo requests answered from the local node database.
    pub nodeinfo_cache_hits: u32,
    /// Relayed broadcasts whose hop limit was exhausted.
    pub hop_exhausted_packets: u32,
    /// Router-to-router relays that kept their hop limit.
    pub router_hops_preserved: u32,
}

impl TrafficStats {
    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        // Plain integer fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Total packets suppressed by any drop policy.
    pub fn total_drops(&self) -> u64 {
        u64::from(self.position_dedup_drops)
            + u64::from(self.rate_limit_drops)
            + u64::from(self.unknown_packet_drops)
    }
}

/// Increment a counter, clamping at its maximum.
pub(crate) fn bump(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = TrafficStats::default();
        assert_eq!(stats.packets_inspected, 0);
        assert_eq!(stats.total_drops(), 0);
    }

    #[test]
    fn test_bump_saturates() {
        let mut counter = u32::MAX - 1;
        bump(&mut counter);
        bump(&mut counter);
        assert_eq!(counter, u32::MAX);
    }

    #[test]
    fn test_stats_json() {
        let stats = TrafficStats {
            packets_inspected: 10,
            rate_limit_drops: 2,
            hop_exhausted_packets: 1,
            ..Default::default()
        };
        let json = stats.to_json();
        assert!(json.contains("\"packets_inspected\":10"));
        assert!(json.contains("\"rate_limit_drops\":2"));
        assert!(json.contains("\"hop_exhausted_packets\":1"));
        assert!(json.contains("\"router_hops_preserved\":0"));
    }

    #[test]
    fn test_total_drops() {
        let stats = TrafficStats {
            position_dedup_drops: 1,
            rate_limit_drops: 2,
            unknown_packet_drops: 3,
            nodeinfo_cache_hits: 100,
            ..Default::default()
        };
        assert_eq!(stats.total_drops(), 6);
    }
}
