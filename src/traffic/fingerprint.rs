//! Lossy 8-bit position fingerprint.
//!
//! Positions are first snapped to a grid whose cell size is set by the
//! configured precision (number of significant bits kept from each
//! coordinate). The fingerprint is the low 4 bits of the latitude cell index
//! followed by the low 4 bits of the longitude cell index.
//!
//! Adjacent cells always produce different fingerprints. Two positions collide
//! only when they are a multiple of 16 cells apart on both axes at once.

/// Highest meaningful precision for 32-bit coordinates.
pub const MAX_PRECISION_BITS: u8 = 32;

/// Bits taken from each coordinate into the fingerprint.
const BITS_PER_AXIS: u8 = 4;

/// Snap a coordinate to the centre of its precision grid cell.
///
/// `precision` is the number of high bits kept. `0` and values of 32 or more
/// disable truncation and return the coordinate unchanged.
pub fn truncate_lat_lon(value: i32, precision: u8) -> i32 {
    if precision == 0 || precision >= MAX_PRECISION_BITS {
        return value;
    }

    let mask = u32::MAX << (32 - precision);
    let truncated = (value as u32) & mask;
    // Centre of the cell.
    truncated.wrapping_add(1u32 << (31 - precision)) as i32
}

/// Compute the 8-bit fingerprint of an already truncated position.
///
/// Returns `0` when precision is `0` or `32+`, so all positions compare
/// equal and deduplication falls back to the time window alone.
pub fn position_fingerprint(lat_truncated: i32, lon_truncated: i32, precision: u8) -> u8 {
    if precision == 0 || precision >= MAX_PRECISION_BITS {
        return 0;
    }

    let bits = precision.min(BITS_PER_AXIS);
    let shift = 32 - precision;
    let mask = (1u32 << bits) - 1;
    let lat = ((lat_truncated as u32) >> shift) & mask;
    let lon = ((lon_truncated as u32) >> shift) & mask;

    ((lat << BITS_PER_AXIS) | lon) as u8
}

/// Truncate and fingerprint a raw position in one step.
pub fn fingerprint_position(latitude_i: i32, longitude_i: i32, precision: u8) -> u8 {
    let precision = precision.min(MAX_PRECISION_BITS);
    position_fingerprint(
        truncate_lat_lon(latitude_i, precision),
        truncate_lat_lon(longitude_i, precision),
        precision,
    )
}
