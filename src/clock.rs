//! Wall-clock timestamps shared by every on-disk artifact
//!
//! Markers, heartbeats and entries all store milliseconds since the Unix
//! epoch so that sibling processes can compare them directly.

use chrono::Utc;
use std::time::Duration;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds elapsed since `timestamp`; negative if it lies in the future
pub fn age_millis(timestamp: i64) -> i64 {
    now_millis().saturating_sub(timestamp)
}

/// Saturating conversion for comparisons against stored timestamps
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
