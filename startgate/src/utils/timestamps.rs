//! Timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with microseconds, e.g.
/// `2026-10-18T07:41:09.123456Z`.
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Formats `at` the way artifacts and events record times.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_rfc3339_micros() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 7, 41, 9).unwrap();
        assert_eq!(format_timestamp(at), "2026-10-18T07:41:09.000000Z");
    }

    #[test]
    fn test_now_parses_back() {
        let ts = iso_timestamp();
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
