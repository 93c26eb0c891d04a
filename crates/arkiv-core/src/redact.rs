//! Secret redaction for logs and ticket notes.
//!
//! Every free-form string that leaves the process (log events, error notes)
//! passes through [`SecretRedactor::scrub`]. The patterns target common
//! credential shapes without trying to understand the surrounding text:
//!
//! - `Authorization: Bearer/Token/Basic <value>` headers
//! - TMS-style `Token token=<value>` headers
//! - `key=value` / `key: value` pairs where the key smells like a secret
//! - `?token=<value>`-style query parameters
//!
//! Matched values are replaced with `[redacted]`. Redaction stays
//! best-effort: it keeps logs readable while making accidental credential
//! leakage unlikely.

use regex::Regex;

/// Replacement for matched secret values.
pub const REDACTED_VALUE: &str = "[redacted]";

/// Key fragments that mark a config key as secret-bearing.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "token",
    "secret",
    "authorization",
    "api_key",
    "apikey",
];

/// Compiled redaction patterns, built once and shared.
pub struct SecretRedactor {
    authz_scheme: Regex,
    token_token: Regex,
    common_kv: Regex,
    query_param: Regex,
}

impl SecretRedactor {
    /// Compiles the redaction patterns.
    ///
    /// # Panics
    ///
    /// Panics only if the built-in patterns are invalid, which is covered by
    /// tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            authz_scheme: Regex::new(
                r"(?i)\b(authorization)\s*[:=]\s*(bearer|token|basic)\s+([^\s,;]+)",
            )
            .expect("authz pattern"),
            token_token: Regex::new(r"(?i)\bToken\s+token=([^\s,;]+)").expect("token pattern"),
            common_kv: Regex::new(
                r"(?i)\b(token|api[_-]?token|access[_-]?token|refresh[_-]?token|webhook[_-]?secret|secret|password|passwd|tsa[_-]?pass|pfx[_-]?password|key[_-]?password)\s*[:=]\s*([^\s,;]+)",
            )
            .expect("kv pattern"),
            query_param: Regex::new(
                r"(?i)([?&](?:api[_-]?token|access[_-]?token|refresh[_-]?token|token|secret)=)([^&\s]+)",
            )
            .expect("query pattern"),
        }
    }

    /// Scrubs secrets from free-form text.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let out = self
            .authz_scheme
            .replace_all(text, format!("$1: $2 {REDACTED_VALUE}"));
        let out = self
            .token_token
            .replace_all(&out, format!("Token token={REDACTED_VALUE}"));
        let out = self
            .common_kv
            .replace_all(&out, format!("$1={REDACTED_VALUE}"));
        let out = self
            .query_param
            .replace_all(&out, format!("${{1}}{REDACTED_VALUE}"));
        out.into_owned()
    }
}

impl Default for SecretRedactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a config key name should be treated as secret-bearing.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    if normalized.ends_with("_pass") {
        return true;
    }
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_authorization_headers() {
        let redactor = SecretRedactor::new();
        let out = redactor.scrub("failed: Authorization: Bearer abc123xyz at /api");
        assert!(!out.contains("abc123xyz"), "got: {out}");
        assert!(out.contains(REDACTED_VALUE));
    }

    #[test]
    fn scrubs_tms_token_header() {
        let redactor = SecretRedactor::new();
        let out = redactor.scrub("request sent with Token token=s3cr3tvalue failed");
        assert!(!out.contains("s3cr3tvalue"));
        assert_eq!(
            out,
            format!("request sent with Token token={REDACTED_VALUE} failed")
        );
    }

    #[test]
    fn scrubs_key_value_pairs() {
        let redactor = SecretRedactor::new();
        for input in [
            "pfx_password=hunter2",
            "api_token: deadbeef",
            "WEBHOOK_SECRET=topsecret",
            "tsa-pass=abc",
        ] {
            let out = redactor.scrub(input);
            assert!(out.contains(REDACTED_VALUE), "not scrubbed: {input} -> {out}");
        }
    }

    #[test]
    fn scrubs_query_parameters() {
        let redactor = SecretRedactor::new();
        let out = redactor.scrub("GET https://tms.example/api?api_token=abc123 failed");
        assert!(!out.contains("abc123"), "got: {out}");
        assert!(out.contains(REDACTED_VALUE));
        assert!(out.contains("https://tms.example/api"));
        assert!(out.ends_with(" failed"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let redactor = SecretRedactor::new();
        let input = "ticket 42 not found at https://tms.example/api/v1/tickets/42";
        assert_eq!(redactor.scrub(input), input);
    }

    #[test]
    fn sensitive_key_detection() {
        assert!(is_sensitive_key("pfx_password"));
        assert!(is_sensitive_key("API_TOKEN"));
        assert!(is_sensitive_key("webhook_secret"));
        assert!(is_sensitive_key("tsa_pass"));
        assert!(!is_sensitive_key("storage_root"));
        assert!(!is_sensitive_key("trigger_tag"));
    }
}
