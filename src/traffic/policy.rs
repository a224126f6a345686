//! Traffic policies.
//!
//! Cache-backed policies are methods on [`CacheState`] and must be called
//! with the cache lock held. Stateless policies (NodeInfo response range, hop
//! exhaustion) are free functions over the packet and configuration.
//!
//! Every cache-backed policy fails open: if the table cannot make room for a
//! node, the packet is judged as if nothing were known about its sender.

use log::debug;

use super::config::{DeviceRole, LocalNode, TrafficConfig};
use super::cuckoo::CuckooTable;
use super::fingerprint::fingerprint_position;
use super::timestamp::{is_within_window, CacheEpoch, TickResolution};
use crate::packet::{MeshPacket, NodeId, PortNum};

/// Most hops a router-class node answers NodeInfo requests from.
pub const ROUTER_MAX_HOPS: u32 = 3;

/// Most hops any other node answers NodeInfo requests from (direct only).
pub const CLIENT_MAX_HOPS: u32 = 0;

/// Position TTL in maintenance sweeps, in multiples of the dedup interval.
const POSITION_TTL_FACTOR: u64 = 4;

/// Rate TTL in maintenance sweeps, in multiples of the rate window.
const RATE_TTL_FACTOR: u64 = 2;

/// Rate TTL used when no rate window is configured.
const RATE_TTL_FALLBACK_MS: u64 = 10 * 60 * 1000;

/// Unknown-packet TTL in maintenance sweeps.
const UNKNOWN_TTL_MS: u64 = 5 * 60 * 1000;

fn secs_to_ms(secs: u32) -> u64 {
    u64::from(secs) * 1000
}

/// Encode the time a position was accepted.
///
/// `pos_time` stores ticks + 1 so that 0 means no position on record.
fn stamp_position(epoch: &CacheEpoch, now_ms: u64) -> u8 {
    epoch.to_relative(now_ms, epoch.position()).saturating_add(1)
}

/// Time the recorded position was accepted, if there is one.
fn position_accepted_at(epoch: &CacheEpoch, pos_time: u8) -> Option<u64> {
    pos_time
        .checked_sub(1)
        .map(|ticks| epoch.from_relative(ticks, epoch.position()))
}

/// Result of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records with at least one field still inside its TTL.
    pub active: usize,
    /// Records freed because every field expired.
    pub expired: usize,
}

/// Cache table plus the epoch its timestamps are relative to.
pub struct CacheState {
    table: CuckooTable,
    epoch: CacheEpoch,
}

impl CacheState {
    /// Allocate the table and start the epoch at `now_ms`.
    pub fn new(config: &TrafficConfig, now_ms: u64) -> Self {
        let epoch = CacheEpoch::new(
            now_ms,
            TickResolution::from_interval_secs(config.position_min_interval_secs),
            TickResolution::from_interval_secs(config.rate_limit_window_secs),
            TickResolution::from_interval_secs(config.unknown_window_secs()),
        );
        Self {
            table: CuckooTable::with_capacity(config.cache_size),
            epoch,
        }
    }

    /// The record table.
    pub fn table(&self) -> &CuckooTable {
        &self.table
    }

    /// The timestamp epoch.
    pub fn epoch(&self) -> &CacheEpoch {
        &self.epoch
    }

    /// Decide whether an undecodable packet from `from` should be dropped.
    ///
    /// Counts undecodable packets per window (the rate-limit window, or 60 s
    /// when none is set) and drops once the count exceeds the threshold.
    pub fn should_drop_unknown(&mut self, config: &TrafficConfig, from: NodeId, now_ms: u64) -> bool {
        if !config.drop_unknown_enabled || config.unknown_packet_threshold == 0 {
            return false;
        }

        let Some((slot, is_new)) = self.table.find_or_create(from) else {
            debug!("Unknown check 0x{:08x}: cache full, allowing", from);
            return false;
        };

        let epoch = self.epoch;
        let window_ms = secs_to_ms(config.unknown_window_secs());
        let threshold = config.unknown_threshold();

        self.table.update(slot, |entry| {
            let start = epoch.from_relative(entry.unknown_time, epoch.unknown());
            if is_new || !is_within_window(now_ms, start, window_ms) {
                entry.unknown_time = epoch.to_relative(now_ms, epoch.unknown());
                entry.unknown_count = 0;
            }

            let saturated = entry.unknown_count == u8::MAX;
            entry.bump_unknown();

            let drop = saturated || entry.unknown_count > threshold;
            if drop || entry.unknown_count == threshold {
                debug!(
                    "Unknown packets 0x{:08x}: count={} threshold={} -> {}",
                    from,
                    entry.unknown_count,
                    threshold,
                    if drop { "DROP" } else { "at-limit" }
                );
            }
            drop
        })
    }

    /// Decide whether a position report is a duplicate of the last one.
    ///
    /// Drops when the fingerprint is unchanged and less than the configured
    /// interval has passed since the last accepted report. Accepted reports
    /// become the new baseline; dropped ones leave it alone. A record created
    /// by another policy has no baseline, so its first report is accepted.
    pub fn should_drop_position(
        &mut self,
        config: &TrafficConfig,
        from: NodeId,
        latitude_i: i32,
        longitude_i: i32,
        now_ms: u64,
    ) -> bool {
        let precision = config.precision_bits();
        let fingerprint = fingerprint_position(latitude_i, longitude_i, precision);
        let interval_ms = secs_to_ms(config.position_min_interval_secs);

        let Some((slot, _)) = self.table.find_or_create(from) else {
            debug!("Position dedup 0x{:08x}: cache full, allowing", from);
            return false;
        };

        let epoch = self.epoch;
        self.table.update(slot, |entry| {
            let last_accepted = position_accepted_at(&epoch, entry.pos_time);
            let same_position = last_accepted.is_some() && entry.pos_fingerprint == fingerprint;
            let within_interval =
                last_accepted.is_some_and(|at| is_within_window(now_ms, at, interval_ms));

            debug!(
                "Position dedup 0x{:08x}: fp=0x{:02x} prev=0x{:02x} same={} within={} recorded={}",
                from,
                fingerprint,
                entry.pos_fingerprint,
                same_position,
                within_interval,
                last_accepted.is_some()
            );

            if same_position && within_interval {
                return true;
            }
            entry.pos_fingerprint = fingerprint;
            entry.pos_time = stamp_position(&epoch, now_ms);
            false
        })
    }

    /// Count a packet against its sender's rate window.
    ///
    /// The first packet of a window resets the count to 1. Later packets
    /// increment it (saturating) and are dropped once it exceeds the limit.
    pub fn is_rate_limited(&mut self, config: &TrafficConfig, from: NodeId, now_ms: u64) -> bool {
        let window_ms = secs_to_ms(config.rate_limit_window_secs);
        if window_ms == 0 || config.rate_limit_max_packets == 0 {
            return false;
        }

        let Some((slot, is_new)) = self.table.find_or_create(from) else {
            debug!("Rate limit 0x{:08x}: cache full, allowing", from);
            return false;
        };

        let epoch = self.epoch;
        let threshold = config.rate_limit_threshold();

        self.table.update(slot, |entry| {
            let start = epoch.from_relative(entry.rate_time, epoch.rate());
            if is_new || !is_within_window(now_ms, start, window_ms) {
                entry.rate_time = epoch.to_relative(now_ms, epoch.rate());
                entry.rate_count = 1;
                return false;
            }

            let saturated = entry.rate_count == u8::MAX;
            entry.bump_rate();

            let limited = saturated || entry.rate_count > threshold;
            if limited || entry.rate_count == threshold {
                debug!(
                    "Rate limit 0x{:08x}: count={} threshold={} -> {}",
                    from,
                    entry.rate_count,
                    threshold,
                    if limited { "DROP" } else { "at-limit" }
                );
            }
            limited
        })
    }

    /// Rebase the epoch to `now_ms` if stored ticks are close to overflowing.
    ///
    /// Relative timestamps cannot be carried across a rebase, so the whole
    /// table is emptied. Returns whether a reset happened.
    pub fn reset_epoch_if_needed(&mut self, now_ms: u64) -> bool {
        if !self.epoch.needs_reset(now_ms) {
            return false;
        }
        self.reset_epoch(now_ms);
        true
    }

    /// Rebase the epoch and empty the table.
    pub fn reset_epoch(&mut self, now_ms: u64) {
        debug!("Resetting cache epoch ({} entries dropped)", self.table.len());
        self.epoch.rebase(now_ms);
        self.table.clear();
    }

    /// Clear fields that outlived their TTL and free records with nothing left.
    pub fn sweep_expired(&mut self, config: &TrafficConfig, now_ms: u64) -> SweepReport {
        let epoch = self.epoch;
        let position_ttl = secs_to_ms(config.position_min_interval_secs) * POSITION_TTL_FACTOR;
        let rate_ttl = match config.rate_limit_window_secs {
            0 => RATE_TTL_FALLBACK_MS,
            secs => secs_to_ms(secs) * RATE_TTL_FACTOR,
        };
        let unknown_ttl = UNKNOWN_TTL_MS;

        let (active, expired) = self.table.sweep(|entry| {
            let mut any_valid = false;

            match position_accepted_at(&epoch, entry.pos_time) {
                Some(at) if is_within_window(now_ms, at, position_ttl) => any_valid = true,
                _ => entry.clear_position(),
            }

            let rate_at = epoch.from_relative(entry.rate_time, epoch.rate());
            if is_within_window(now_ms, rate_at, rate_ttl) {
                any_valid = true;
            } else {
                entry.clear_rate();
            }

            let unknown_at = epoch.from_relative(entry.unknown_time, epoch.unknown());
            if is_within_window(now_ms, unknown_at, unknown_ttl) {
                any_valid = true;
            } else {
                entry.clear_unknown();
            }

            any_valid
        });

        SweepReport { active, expired }
    }
}

/// Whether `packet` is a NodeInfo request another node might answer for.
///
/// Only unicast requests that want a response, are not for us and were not
/// sent by us qualify.
pub fn is_foreign_nodeinfo_request(packet: &MeshPacket, local: &LocalNode) -> bool {
    let Some(data) = packet.decoded_data() else {
        return false;
    };
    data.port == PortNum::NodeInfo
        && data.want_response
        && !packet.is_broadcast()
        && packet.to != local.node
        && packet.from != local.node
}

/// Hop range within which this node answers NodeInfo requests.
///
/// A configured value of 0 selects the role default; any value is clamped to
/// the role limit so configuration can narrow but never widen the range.
pub fn nodeinfo_max_hops(config: &TrafficConfig, role: DeviceRole) -> u32 {
    let role_limit = if role.is_router() {
        ROUTER_MAX_HOPS
    } else {
        CLIENT_MAX_HOPS
    };
    let configured = config.nodeinfo_direct_response_max_hops;
    let max_hops = if configured > 0 { configured } else { role_limit };
    max_hops.min(role_limit)
}

/// Whether the requester is close enough for a direct NodeInfo response.
pub fn is_within_response_range(packet: &MeshPacket, config: &TrafficConfig, role: DeviceRole) -> bool {
    let Some(hops_away) = packet.hops_away() else {
        return false;
    };
    let max_hops = nodeinfo_max_hops(config, role);
    let within = u32::from(hops_away) <= max_hops;
    debug!(
        "NodeInfo hops check: hops_away={} max_hops={} router={} -> {}",
        hops_away,
        max_hops,
        role.is_router(),
        if within { "respond" } else { "skip" }
    );
    within
}

/// Reason to exhaust the hop limit of a relayed broadcast, if any.
///
/// Applies to decoded broadcasts from other nodes on a port configured for
/// exhaustion that still have hops left.
pub fn hop_exhaust_reason(
    packet: &MeshPacket,
    config: &TrafficConfig,
    local: &LocalNode,
) -> Option<&'static str> {
    let port = packet.port()?;
    if packet.from == local.node || !packet.is_broadcast() || packet.hop_limit == 0 {
        return None;
    }
    match port {
        PortNum::Telemetry if config.exhaust_hop_telemetry => Some("exhaust-hop-telemetry"),
        PortNum::Position if config.exhaust_hop_position => Some("exhaust-hop-position"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BROADCAST_ADDR;

    const REMOTE: NodeId = 0x2222_2222;
    const LOCAL: NodeId = 0x1111_1111;
    const TARGET: NodeId = 0x3333_3333;

    fn local(role: DeviceRole) -> LocalNode {
        LocalNode { node: LOCAL, role }
    }

    #[test]
    fn test_unknown_disabled_never_drops() {
        let config = TrafficConfig::enabled();
        let mut state = CacheState::new(&config, 0);
        for _ in 0..10 {
            assert!(!state.should_drop_unknown(&config, REMOTE, 0));
        }
        assert!(state.table().is_empty());
    }

    #[test]
    fn test_unknown_threshold_n_plus_one() {
        let config = TrafficConfig {
            drop_unknown_enabled: true,
            unknown_packet_threshold: 2,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.should_drop_unknown(&config, REMOTE, 10));
        assert!(!state.should_drop_unknown(&config, REMOTE, 20));
        assert!(state.should_drop_unknown(&config, REMOTE, 30));
        assert!(state.should_drop_unknown(&config, REMOTE, 40));
    }

    #[test]
    fn test_rate_window_resets() {
        let config = TrafficConfig {
            rate_limit_enabled: true,
            rate_limit_window_secs: 60,
            rate_limit_max_packets: 1,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.is_rate_limited(&config, REMOTE, 1_000));
        assert!(state.is_rate_limited(&config, REMOTE, 2_000));
        // 60 s ticks: the window started at tick 0 and has passed by 61 s.
        assert!(!state.is_rate_limited(&config, REMOTE, 61_000));
        assert!(state.is_rate_limited(&config, REMOTE, 62_000));
    }

    #[test]
    fn test_rate_limit_zero_max_is_off() {
        let config = TrafficConfig {
            rate_limit_enabled: true,
            rate_limit_max_packets: 0,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        for _ in 0..5 {
            assert!(!state.is_rate_limited(&config, REMOTE, 0));
        }
    }

    #[test]
    fn test_position_dropped_duplicate_keeps_baseline() {
        let config = TrafficConfig {
            position_dedup_enabled: true,
            position_min_interval_secs: 300, // 150 s ticks
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        let (lat, lon) = (374_221_234, -1_220_845_678);

        assert!(!state.should_drop_position(&config, REMOTE, lat, lon, 0));
        assert!(state.should_drop_position(&config, REMOTE, lat, lon, 200_000));
        // Baseline is still t=0, so the interval has passed at 300 s.
        assert!(!state.should_drop_position(&config, REMOTE, lat, lon, 300_000));
    }

    #[test]
    fn test_policies_fail_open_when_table_full() {
        let config = TrafficConfig {
            cache_size: 2,
            drop_unknown_enabled: true,
            unknown_packet_threshold: 1,
            rate_limit_enabled: true,
            rate_limit_max_packets: 1,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        // Two slots: fill both, then a third node cannot be placed.
        for node in 1..=64u32 {
            assert!(!state.is_rate_limited(&config, node, 0));
            if state.table().len() == 2 {
                break;
            }
        }
        assert_eq!(state.table().len(), 2);

        let stranger = (1..=64u32).find(|n| state.table().find(*n).is_none()).unwrap();
        for _ in 0..5 {
            assert!(!state.is_rate_limited(&config, stranger, 0));
            assert!(!state.should_drop_unknown(&config, stranger, 0));
        }
    }

    #[test]
    fn test_epoch_reset_empties_table() {
        let config = TrafficConfig {
            rate_limit_enabled: true,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.is_rate_limited(&config, REMOTE, 0));
        assert_eq!(state.table().len(), 1);

        let reset_at = state.epoch().reset_after_ms();
        assert!(!state.reset_epoch_if_needed(reset_at));
        assert!(state.reset_epoch_if_needed(reset_at + 1));
        assert!(state.table().is_empty());
        assert_eq!(state.epoch().epoch_ms(), reset_at + 1);
    }

    #[test]
    fn test_sweep_frees_stale_records() {
        let config = TrafficConfig {
            rate_limit_enabled: true,
            rate_limit_window_secs: 60,
            position_min_interval_secs: 60,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.is_rate_limited(&config, REMOTE, 0));

        let report = state.sweep_expired(&config, 60_000);
        assert_eq!(report, SweepReport { active: 1, expired: 0 });

        // Position TTL 240 s, rate TTL 120 s, unknown TTL 300 s.
        let report = state.sweep_expired(&config, 301_000);
        assert_eq!(report, SweepReport { active: 0, expired: 1 });
        assert!(state.table().is_empty());
    }

    #[test]
    fn test_sweep_clears_only_expired_fields() {
        let config = TrafficConfig {
            rate_limit_enabled: true,
            rate_limit_window_secs: 60,
            position_min_interval_secs: 600,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.is_rate_limited(&config, REMOTE, 0));
        assert!(!state.is_rate_limited(&config, REMOTE, 1_000));
        assert!(!state.should_drop_position(&config, REMOTE, 10, 20, 0));

        // Rate TTL (120 s) is gone, position TTL (2400 s) is not.
        let report = state.sweep_expired(&config, 200_000);
        assert_eq!(report.active, 1);
        let slot = state.table().find(REMOTE).unwrap();
        assert_eq!(state.table().get(slot).rate_count, 0);
    }

    #[test]
    fn test_first_position_on_record_created_elsewhere() {
        let config = TrafficConfig {
            position_dedup_enabled: true,
            rate_limit_enabled: true,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.is_rate_limited(&config, REMOTE, 10_000));

        // (10, 20) fingerprints to 0, the value of an unset record.
        assert_eq!(fingerprint_position(10, 20, config.precision_bits()), 0);
        assert!(!state.should_drop_position(&config, REMOTE, 10, 20, 10_000));
        assert!(state.should_drop_position(&config, REMOTE, 10, 20, 20_000));
    }

    #[test]
    fn test_position_marker_survives_tick_zero() {
        let config = TrafficConfig {
            position_dedup_enabled: true,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.should_drop_position(&config, REMOTE, 10, 20, 0));

        let slot = state.table().find(REMOTE).unwrap();
        assert_eq!(state.table().get(slot).pos_time, 1);
        assert!(state.should_drop_position(&config, REMOTE, 10, 20, 1_000));
    }

    #[test]
    fn test_sweep_clears_position_marker() {
        let config = TrafficConfig {
            position_dedup_enabled: true,
            position_min_interval_secs: 60,
            rate_limit_enabled: true,
            rate_limit_window_secs: 60,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.should_drop_position(&config, REMOTE, 10, 20, 0));
        assert!(!state.is_rate_limited(&config, REMOTE, 200_000));

        // Position TTL 240 s is gone, the rate window from 180 s is not.
        let report = state.sweep_expired(&config, 250_000);
        assert_eq!(report.active, 1);
        let slot = state.table().find(REMOTE).unwrap();
        assert_eq!(state.table().get(slot).pos_time, 0);
    }

    #[test]
    fn test_unknown_ttl_is_five_minutes() {
        let config = TrafficConfig {
            drop_unknown_enabled: true,
            rate_limit_window_secs: 600,
            ..TrafficConfig::enabled()
        };
        let mut state = CacheState::new(&config, 0);
        assert!(!state.should_drop_unknown(&config, REMOTE, 0));

        state.sweep_expired(&config, 299_000);
        let slot = state.table().find(REMOTE).unwrap();
        assert_eq!(state.table().get(slot).unknown_count, 1);

        state.sweep_expired(&config, 301_000);
        if let Some(slot) = state.table().find(REMOTE) {
            assert_eq!(state.table().get(slot).unknown_count, 0);
        }
    }

    #[test]
    fn test_nodeinfo_max_hops_by_role() {
        let mut config = TrafficConfig::enabled();
        config.nodeinfo_direct_response_max_hops = 10;
        assert_eq!(nodeinfo_max_hops(&config, DeviceRole::Router), 3);
        assert_eq!(nodeinfo_max_hops(&config, DeviceRole::Client), 0);

        config.nodeinfo_direct_response_max_hops = 2;
        assert_eq!(nodeinfo_max_hops(&config, DeviceRole::Router), 2);

        config.nodeinfo_direct_response_max_hops = 0;
        assert_eq!(nodeinfo_max_hops(&config, DeviceRole::RouterLate), 3);
        assert_eq!(nodeinfo_max_hops(&config, DeviceRole::Tracker), 0);
    }

    #[test]
    fn test_nodeinfo_request_filter() {
        let me = local(DeviceRole::Client);
        let plain = MeshPacket::decoded(REMOTE, TARGET, PortNum::NodeInfo);
        assert!(!is_foreign_nodeinfo_request(&plain, &me));

        let request = plain.with_want_response();
        assert!(is_foreign_nodeinfo_request(&request, &me));

        let mut to_us = request.clone();
        to_us.to = LOCAL;
        assert!(!is_foreign_nodeinfo_request(&to_us, &me));

        let mut broadcast = request.clone();
        broadcast.to = BROADCAST_ADDR;
        assert!(!is_foreign_nodeinfo_request(&broadcast, &me));

        let mut from_us = request;
        from_us.from = LOCAL;
        assert!(!is_foreign_nodeinfo_request(&from_us, &me));
    }

    #[test]
    fn test_response_range_needs_valid_hops() {
        let config = TrafficConfig::enabled();
        let mut request = MeshPacket::decoded(REMOTE, TARGET, PortNum::NodeInfo);
        request.hop_start = 0;
        request.hop_limit = 0;
        assert!(!is_within_response_range(&request, &config, DeviceRole::Router));

        request.hop_start = 3;
        request.hop_limit = 3;
        assert!(is_within_response_range(&request, &config, DeviceRole::Client));
    }

    #[test]
    fn test_hop_exhaust_reason() {
        let me = local(DeviceRole::Client);
        let config = TrafficConfig {
            exhaust_hop_telemetry: true,
            ..TrafficConfig::enabled()
        };

        let telemetry = MeshPacket::decoded(REMOTE, BROADCAST_ADDR, PortNum::Telemetry);
        assert_eq!(
            hop_exhaust_reason(&telemetry, &config, &me),
            Some("exhaust-hop-telemetry")
        );

        let position = MeshPacket::decoded(REMOTE, BROADCAST_ADDR, PortNum::Position);
        assert_eq!(hop_exhaust_reason(&position, &config, &me), None);

        let mut spent = telemetry.clone();
        spent.hop_limit = 0;
        assert_eq!(hop_exhaust_reason(&spent, &config, &me), None);

        let encrypted = MeshPacket::encrypted(REMOTE, BROADCAST_ADDR);
        assert_eq!(hop_exhaust_reason(&encrypted, &config, &me), None);
    }
}
