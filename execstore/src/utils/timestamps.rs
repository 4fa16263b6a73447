//! Epoch-millisecond timestamp helpers.

use chrono::Utc;

/// Returns the current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Returns the current UTC time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
