//! HTTP-date conversion at epoch-millisecond granularity.
//!
//! HTTP dates (RFC 9110 §5.6.7) only carry whole seconds, so every value that
//! passes through a header is truncated to a second boundary.

use std::time::{Duration, UNIX_EPOCH};

/// Parses an HTTP-date header value into epoch milliseconds.
///
/// Returns `None` for malformed values and for dates before the epoch.
pub fn parse_millis(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value.trim()).ok()?;
    let since_epoch = time.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

/// Formats epoch milliseconds as an IMF-fixdate. Negative inputs clamp to the epoch.
pub fn format_millis(millis: i64) -> String {
    let millis = u64::try_from(millis).unwrap_or(0);
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(millis))
}

/// Rounds an epoch-millisecond timestamp down to a whole second.
pub fn floor_to_seconds(millis: i64) -> i64 {
    millis - millis.rem_euclid(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_then_parse_truncates_to_seconds() {
        let formatted = format_millis(1_000_999);
        assert_eq!(formatted, "Thu, 01 Jan 1970 00:16:40 GMT");
        assert_eq!(parse_millis(&formatted), Some(1_000_000));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_millis("yesterday"), None);
        assert_eq!(parse_millis(""), None);
    }

    #[test]
    fn floor_handles_negative_values() {
        assert_eq!(floor_to_seconds(1_499), 1_000);
        assert_eq!(floor_to_seconds(-1), -1_000);
        assert_eq!(floor_to_seconds(2_000), 2_000);
    }
}
