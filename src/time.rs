//! Timestamp parsing and formatting shared by ingest, query and live-tail.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses an RFC 3339 timestamp into milliseconds since the Unix epoch.
pub fn parse_rfc3339_ms(text: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// A couple of additional layouts tried by the `best_effort` timestamp
/// policy before falling back to the current time.
pub fn parse_best_effort_ms(text: &str) -> Option<i64> {
    if let Some(ms) = parse_rfc3339_ms(text) {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::<Utc>::from_utc(naive, Utc).timestamp_millis());
    }
    None
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Renders milliseconds since the epoch as RFC 3339 with nanosecond
/// precision, matching the query response's `timestamp` field.
pub fn format_timestamp_ms(ms: i64) -> String {
    let secs = ms.div_euclid(1000);
    let millis_rem = ms.rem_euclid(1000);
    let naive = NaiveDateTime::from_timestamp(secs, (millis_rem as u32) * 1_000_000);
    DateTime::<Utc>::from_utc(naive, Utc).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        let ms = parse_rfc3339_ms("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(format_timestamp_ms(ms).starts_with("2024-01-15T10:30:00"), true);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_rfc3339_ms("not a timestamp").is_none());
    }

    #[test]
    fn best_effort_falls_back_through_layouts() {
        assert!(parse_best_effort_ms("2024-01-15T10:30:00Z").is_some());
        assert!(parse_best_effort_ms("2024-01-15 10:30:00").is_some());
        assert!(parse_best_effort_ms("garbage").is_none());
    }
}
