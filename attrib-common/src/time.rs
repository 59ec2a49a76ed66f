//! Timestamp utilities

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};

/// Interpret an epoch value as a UTC timestamp
///
/// Values below 10^11 are taken as seconds, anything larger as milliseconds.
/// Ingestion has written both over time.
pub fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() < 100_000_000_000 {
        Utc.timestamp_opt(value, 0).single()
    } else {
        Utc.timestamp_millis_opt(value).single()
    }
}

/// Truncate a timestamp to the start of its hour
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}
