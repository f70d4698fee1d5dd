//! Log Redaction Layer
//!
//! Scrubs API keys, bearer tokens, and credential query parameters from
//! strings prior to logging.

use regex::Regex;
use std::sync::LazyLock;

static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9_\-]{20,})|(AIza[0-9A-Za-z_\-]{35})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)")
        .expect("static regex")
});
static QUERY_SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&](?:key|api_key|access_token|token)=)[^&\s]+").expect("static regex")
});

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = API_KEY_RE.replace_all(input, "[REDACTED_TOKEN]");
    QUERY_SECRET_RE
        .replace_all(&redacted, "${1}[REDACTED]")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_tokens() {
        let raw = "calling engine with Bearer eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9 and sk-abcdefghijklmnopqrstuvwxyz123456";
        let clean = redact_sensitive_data(raw);
        assert!(!clean.contains("eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9"));
        assert!(!clean.contains("sk-abcdefghijklmnopqrstuvwxyz123456"));
        assert!(clean.contains("[REDACTED_TOKEN]"));
    }

    #[test]
    fn test_redacts_query_secrets() {
        let raw = "GET https://engines.local/videos?id=abc&key=AIzaSyD-secret-value&part=snippet";
        let clean = redact_sensitive_data(raw);
        assert!(!clean.contains("AIzaSyD-secret-value"));
        assert!(clean.contains("id=abc"));
        assert!(clean.contains("&key=[REDACTED]"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let raw = r#"{"video_id":"dQw4w9WgXcQ","limit":25}"#;
        assert_eq!(redact_sensitive_data(raw), raw);
    }
}
