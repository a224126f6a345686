//! Adaptive-resolution 8-bit relative timestamps.
//!
//! Each cache record stores its timestamps as a single byte counting ticks
//! since a shared epoch. The length of a tick is chosen per field from the
//! configured interval that field is compared against:
//!
//! ```text
//! resolution = clamp(interval / 2, 60 s, 339 s)
//! ```
//!
//! Halving the interval keeps at least two distinguishable ticks inside any
//! configured window. The 60 s floor bounds imprecision for short intervals and
//! the 339 s ceiling gives 255 ticks ≈ 24 h of range.
//!
//! # Example
//!
//! ```
//! use mesh_traffic_esp32::traffic::{CacheEpoch, TickResolution};
//!
//! let res = TickResolution::from_interval_secs(300); // 150 s ticks
//! let epoch = CacheEpoch::new(10_000, res, res, res);
//!
//! let ticks = epoch.to_relative(10_000 + 451_000, res);
//! assert_eq!(ticks, 3);
//! assert_eq!(epoch.from_relative(ticks, res), 10_000 + 450_000);
//! ```

/// Shortest tick length in seconds.
pub const MIN_RESOLUTION_SECS: u32 = 60;

/// Longest tick length in seconds.
pub const MAX_RESOLUTION_SECS: u32 = 339;

/// Ticks of the coarsest field that may elapse before the epoch is rebased.
///
/// Leaves 55 ticks of headroom below the 8-bit ceiling so a maintenance tick
/// arriving late still finds every stored timestamp unclamped.
pub const EPOCH_RESET_TICKS: u64 = 200;

/// Length of one timestamp tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickResolution(u32);

impl TickResolution {
    /// Pick the resolution for a field compared against `interval_secs`.
    pub fn from_interval_secs(interval_secs: u32) -> Self {
        Self((interval_secs / 2).clamp(MIN_RESOLUTION_SECS, MAX_RESOLUTION_SECS))
    }

    /// Tick length in seconds.
    pub fn secs(self) -> u32 {
        self.0
    }

    /// Tick length in milliseconds.
    pub fn millis(self) -> u64 {
        u64::from(self.0) * 1000
    }
}

/// Shared reference time for all relative timestamps in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEpoch {
    epoch_ms: u64,
    position: TickResolution,
    rate: TickResolution,
    unknown: TickResolution,
}

impl CacheEpoch {
    /// Start an epoch at `now_ms` with the three per-field resolutions.
    pub fn new(
        now_ms: u64,
        position: TickResolution,
        rate: TickResolution,
        unknown: TickResolution,
    ) -> Self {
        Self {
            epoch_ms: now_ms,
            position,
            rate,
            unknown,
        }
    }

    /// Absolute epoch time in milliseconds.
    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Resolution of `pos_time`.
    pub fn position(&self) -> TickResolution {
        self.position
    }

    /// Resolution of `rate_time`.
    pub fn rate(&self) -> TickResolution {
        self.rate
    }

    /// Resolution of `unknown_time`.
    pub fn unknown(&self) -> TickResolution {
        self.unknown
    }

    /// Encode an absolute time as ticks since the epoch, clamped to 0..=255.
    pub fn to_relative(&self, now_ms: u64, resolution: TickResolution) -> u8 {
        let ticks = now_ms.saturating_sub(self.epoch_ms) / resolution.millis();
        ticks.min(u64::from(u8::MAX)) as u8
    }

    /// Reconstruct the absolute time a tick value stands for.
    ///
    /// The result rounds down to the start of the tick, so elapsed times
    /// computed from it overestimate by less than one resolution.
    pub fn from_relative(&self, ticks: u8, resolution: TickResolution) -> u64 {
        self.epoch_ms + u64::from(ticks) * resolution.millis()
    }

    /// Coarsest of the three resolutions.
    pub fn max_resolution(&self) -> TickResolution {
        self.position.max(self.rate).max(self.unknown)
    }

    /// Epoch age after which stored timestamps risk clamping.
    pub fn reset_after_ms(&self) -> u64 {
        EPOCH_RESET_TICKS * self.max_resolution().millis()
    }

    /// Whether the epoch must be rebased before timestamps overflow.
    pub fn needs_reset(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.epoch_ms) > self.reset_after_ms()
    }

    /// Move the epoch to `now_ms`. Existing ticks become meaningless.
    pub fn rebase(&mut self, now_ms: u64) {
        self.epoch_ms = now_ms;
    }
}

/// Whether `now_ms` falls less than `window_ms` after `start_ms`.
///
/// A zero-length window never contains anything.
pub fn is_within_window(now_ms: u64, start_ms: u64, window_ms: u64) -> bool {
    window_ms != 0 && now_ms.saturating_sub(start_ms) < window_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_at(now_ms: u64, interval_secs: u32) -> CacheEpoch {
        let res = TickResolution::from_interval_secs(interval_secs);
        CacheEpoch::new(now_ms, res, res, res)
    }

    #[test]
    fn test_resolution_clamps() {
        assert_eq!(TickResolution::from_interval_secs(0).secs(), 60);
        assert_eq!(TickResolution::from_interval_secs(1).secs(), 60);
        assert_eq!(TickResolution::from_interval_secs(119).secs(), 60);
        assert_eq!(TickResolution::from_interval_secs(300).secs(), 150);
        assert_eq!(TickResolution::from_interval_secs(678).secs(), 339);
        assert_eq!(TickResolution::from_interval_secs(86_400).secs(), 339);
    }

    #[test]
    fn test_to_relative_floors_and_clamps() {
        let epoch = epoch_at(5_000, 120); // 60 s ticks
        let res = epoch.position();

        assert_eq!(epoch.to_relative(5_000, res), 0);
        assert_eq!(epoch.to_relative(5_000 + 59_999, res), 0);
        assert_eq!(epoch.to_relative(5_000 + 60_000, res), 1);
        assert_eq!(epoch.to_relative(5_000 + 255 * 60_000, res), 255);
        assert_eq!(epoch.to_relative(5_000 + 1_000 * 60_000, res), 255);
    }

    #[test]
    fn test_time_before_epoch_is_tick_zero() {
        let epoch = epoch_at(100_000, 120);
        assert_eq!(epoch.to_relative(1_000, epoch.rate()), 0);
    }

    #[test]
    fn test_from_relative_inverts_tick_start() {
        let epoch = epoch_at(7_000, 300);
        let res = epoch.rate();
        for ticks in [0u8, 1, 17, 255] {
            let abs = epoch.from_relative(ticks, res);
            assert_eq!(epoch.to_relative(abs, res), ticks);
        }
    }

    #[test]
    fn test_reset_threshold_uses_coarsest_field() {
        let epoch = CacheEpoch::new(
            0,
            TickResolution::from_interval_secs(120),
            TickResolution::from_interval_secs(600),
            TickResolution::from_interval_secs(60),
        );
        assert_eq!(epoch.max_resolution().secs(), 300);
        assert_eq!(epoch.reset_after_ms(), 200 * 300 * 1000);
        assert!(!epoch.needs_reset(200 * 300 * 1000));
        assert!(epoch.needs_reset(200 * 300 * 1000 + 1));
    }

    #[test]
    fn test_rebase_moves_epoch() {
        let mut epoch = epoch_at(0, 120);
        epoch.rebase(1_000_000);
        assert_eq!(epoch.epoch_ms(), 1_000_000);
        assert!(!epoch.needs_reset(1_000_000));
        assert_eq!(epoch.to_relative(1_000_000, epoch.position()), 0);
    }

    #[test]
    fn test_window() {
        assert!(is_within_window(1_500, 1_000, 1_000));
        assert!(!is_within_window(2_000, 1_000, 1_000));
        assert!(!is_within_window(1_000, 1_000, 0));
    }
}
