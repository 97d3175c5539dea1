//! Windows FILETIME conversions.
//!
//! Directory entries carry creation and modification times as FILETIME
//! values: 100-nanosecond ticks since 1601-01-01 UTC. A value of zero means
//! "not recorded" and is the required value for stream objects.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between the FILETIME epoch (1601-01-01) and the Unix epoch.
const EPOCH_DELTA_SECS: i64 = 11_644_473_600;

/// Ticks per second (100 ns resolution).
const TICKS_PER_SEC: u64 = 10_000_000;

/// Convert a FILETIME tick count to a calendar timestamp.
///
/// Returns `None` for the zero sentinel and for tick counts that do not map
/// to a representable `DateTime<Utc>`.
pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let secs = (ticks / TICKS_PER_SEC) as i64 - EPOCH_DELTA_SECS;
    let nanos = (ticks % TICKS_PER_SEC) * 100;
    Utc.timestamp_opt(secs, nanos as u32).single()
}

/// Convert a calendar timestamp to FILETIME ticks.
///
/// Timestamps before 1601-01-01 clamp to zero (the "not recorded" value).
pub fn datetime_to_filetime(when: DateTime<Utc>) -> u64 {
    let secs = when.timestamp() + EPOCH_DELTA_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * TICKS_PER_SEC + (when.timestamp_subsec_nanos() / 100) as u64
}

/// The current time as FILETIME ticks.
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}
