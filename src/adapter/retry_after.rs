//! Retry-after extraction from rate-limit responses.
//!
//! Providers do not agree on a structured format. The `Retry-After` header
//! is tried first; otherwise the response body (plain text, or the
//! `error.message` field of a JSON error document) is scanned for
//! "N minutes" / "N seconds" phrasing, e.g.
//!
//! ```text
//! Number of 'read' requests for subscription '…' exceeded.
//! Please try again after '17' minutes.
//! ```
//!
//! A value that cannot be parsed is no hint, never an error. Parsed hints
//! are capped at [`MAX_RETRY_AFTER`].

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Longest hint taken at face value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

static MINUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)['"]?(\d+)['"]?\s*(?:minutes?|mins?)\b"#).expect("valid minutes regex")
});

static SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)['"]?(\d+)['"]?\s*(?:seconds?|secs?)\b"#).expect("valid seconds regex")
});

/// Parse a `Retry-After` header value given in seconds.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Parse a retry-after hint out of a response body.
pub fn parse_retry_after_body(body: &str) -> Option<Duration> {
    let message = json_error_message(body);
    parse_retry_after_text(message.as_deref().unwrap_or(body))
}

/// Scan free text for minutes and seconds; both are summed when present.
pub fn parse_retry_after_text(text: &str) -> Option<Duration> {
    let minutes = capture_number(&MINUTES, text);
    let seconds = capture_number(&SECONDS, text);
    match (minutes, seconds) {
        (None, None) => None,
        (m, s) => Some(
            Duration::from_secs(m.unwrap_or(0).saturating_mul(60).saturating_add(s.unwrap_or(0)))
                .min(MAX_RETRY_AFTER),
        ),
    }
}

fn capture_number(pattern: &Regex, text: &str) -> Option<u64> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn json_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_owned)
}
