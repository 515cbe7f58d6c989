//! Wall-clock helpers.

use chrono::Utc;

/// Current wall-clock time as millisecond epoch.
///
/// All timestamps on the wire use this clock. Matching never consults it for
/// ordering; it only stamps events.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
