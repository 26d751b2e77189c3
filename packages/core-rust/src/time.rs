//! Wall-clock helpers. All persisted timestamps are milliseconds since the
//! Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Milliseconds elapsed since `since_millis`, clamped at zero.
#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn elapsed_since(since_millis: i64, now_millis: i64) -> Duration {
    Duration::from_millis(now_millis.saturating_sub(since_millis).max(0) as u64)
}
