//! Small helpers shared across the crate.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp the way it is stored in the database.
///
/// Millisecond precision with a `Z` suffix keeps every stored value the same
/// width, so SQL string comparison orders them chronologically.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in storage format
pub fn now() -> String {
    format_timestamp(Utc::now())
}

/// Parse a client supplied RFC 3339 timestamp and normalize it to storage format
pub fn normalize_timestamp(value: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| format_timestamp(dt.with_timezone(&Utc)))
}

/// Parse a stored timestamp
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Generate a URL-friendly slug from a name
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert_eq!(format_timestamp(a), "2024-01-01T00:00:00.000Z");
        assert_eq!(format_timestamp(b), "2024-01-01T00:00:01.500Z");
        assert!(format_timestamp(a) < format_timestamp(b));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2024-06-01T12:00:00+02:00").as_deref(),
            Some("2024-06-01T10:00:00.000Z")
        );
        assert!(normalize_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp"), "acme-corp");
        assert_eq!(slugify("  Welcome -- Email!! "), "welcome-email");
        assert_eq!(slugify("Über Cool"), "ber-cool");
    }
}
