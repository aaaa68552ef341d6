//! Timestamp utilities

use chrono::{DateTime, Duration, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Whole-day span as a chrono duration
pub fn days(n: u32) -> Duration {
    Duration::days(i64::from(n))
}

/// Time elapsed between `earlier` and `now`, zero if `earlier` is in the future
pub fn elapsed_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - earlier).to_std().unwrap_or_default()
}
