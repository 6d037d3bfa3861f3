use std::env;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use blake3::Hash;
use chrono::{DateTime, SecondsFormat, Utc};

pub(crate) const BASE_BACKOFF_MS: u64 = 250;
pub(crate) const MAX_RETRY_AFTER_SECS: f64 = 30.0;

pub(crate) fn blake3_hash(bytes: &[u8]) -> Hash {
    blake3::hash(bytes)
}

/// Compare two secrets by digest so the comparison time does not depend on
/// where the inputs first differ.
pub(crate) fn secrets_match(expected: &str, provided: &str) -> bool {
    blake3_hash(expected.as_bytes()) == blake3_hash(provided.as_bytes())
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// Join a base url and a path, tolerating slashes on either side.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = normalize_base_url(base);
    let path = path.trim();
    if path.is_empty() {
        return base;
    }
    format!("{base}/{}", path.trim_start_matches('/'))
}

pub(crate) fn ensure_leading_slash(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Graph expects `2024-01-01T00:00:00.000Z`.
pub(crate) fn graph_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_graph_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

pub(crate) fn parse_retry_after(resp: &ureq::Response) -> Option<f64> {
    resp.header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Delay before the next attempt. A server-provided Retry-After wins, capped.
pub(crate) fn retry_delay(attempt: u32, retry_after: Option<f64>) -> Duration {
    if let Some(secs) = retry_after {
        let secs = secs.clamp(0.0, MAX_RETRY_AFTER_SECS);
        return Duration::from_millis((secs * 1000.0) as u64);
    }
    let base = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(6));
    let jitter = (base as f64 * 0.2 * jitter_ratio()) as u64;
    Duration::from_millis(base + jitter)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

pub(crate) fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("https://x.test/", "/a/b"), "https://x.test/a/b");
        assert_eq!(join_url("https://x.test", "a"), "https://x.test/a");
        assert_eq!(join_url("https://x.test/", ""), "https://x.test");
    }

    #[test]
    fn graph_timestamp_has_millis_and_z() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(graph_timestamp(ts), "2025-03-01T12:30:00.000Z");
        assert_eq!(parse_graph_timestamp("2025-03-01T12:30:00.000Z"), Some(ts));
        assert_eq!(
            parse_graph_timestamp("2025-03-01T12:30:00.0000000Z"),
            Some(ts)
        );
    }

    #[test]
    fn secrets_compare_by_value() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cret "));
        assert!(!secrets_match("s3cret", ""));
    }

    #[test]
    fn retry_delay_prefers_retry_after() {
        assert_eq!(retry_delay(0, Some(2.0)), Duration::from_secs(2));
        assert_eq!(retry_delay(3, Some(500.0)), Duration::from_secs(30));
        let backoff = retry_delay(2, None);
        assert!(backoff >= Duration::from_millis(1000));
        assert!(backoff < Duration::from_millis(1300));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé...");
    }
}
