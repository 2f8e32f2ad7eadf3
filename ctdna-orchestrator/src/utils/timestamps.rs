//! Timestamp helpers for lifecycle events.
//!
//! Lifecycle events carry UTC timestamps at second precision with a `Z`
//! suffix (`2025-06-20T01:02:03Z`).

use chrono::{DateTime, SecondsFormat, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time in lifecycle event format.
///
/// # Examples
///
/// ```
/// use ctdna_orchestrator::utils::utc_timestamp;
///
/// let ts = utc_timestamp();
/// assert!(ts.ends_with('Z'));
/// assert_eq!(ts.len(), 20);
/// ```
#[must_use]
pub fn utc_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Formats a timestamp in lifecycle event format.
#[must_use]
pub fn format_timestamp(dt: &Timestamp) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_second_precision() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 20, 1, 2, 3).unwrap();
        assert_eq!(format_timestamp(&dt), "2025-06-20T01:02:03Z");
    }

    #[test]
    fn test_format_drops_subseconds() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 20, 1, 2, 3).unwrap() + chrono::Duration::milliseconds(450);
        assert_eq!(format_timestamp(&dt), "2025-06-20T01:02:03Z");
    }
}
