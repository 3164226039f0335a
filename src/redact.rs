//! C9 (part 1): secret redaction.
//!
//! Two independent mechanisms, both applied to logs and captured stderr —
//! never to `output_file` bytes, which are the command's own declared
//! product and must reach disk unmodified:
//!
//! - key-based: any `KEY=value` pair whose key matches a denylist pattern
//!   has its value replaced outright.
//! - value-based: the literal value of any allow-listed, imported
//!   environment variable whose *name* matches the same denylist is
//!   registered once at expansion time and scrubbed wherever it appears in
//!   free-form text afterwards (e.g. inside stderr).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

const REDACTED: &str = "***REDACTED***";

/// Case-insensitive substring match against any of these fragments; `_?`
/// between `api` and `key` covers both `API_KEY` and `APIKEY` spellings.
const SENSITIVE_KEY_PATTERN: &str =
    r"(?i)password|passwd|secret|token|api_?key|authorization|auth|credential|private_key|access_key";

fn sensitive_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SENSITIVE_KEY_PATTERN).expect("static pattern is valid"))
}

#[must_use]
pub fn key_looks_sensitive(key: &str) -> bool {
    sensitive_key_regex().is_match(key)
}

/// Redact the value half of a `KEY=value` pair if the key looks sensitive.
#[must_use]
pub fn redact_pair<'a>(key: &str, value: &'a str) -> std::borrow::Cow<'a, str> {
    if key_looks_sensitive(key) {
        std::borrow::Cow::Borrowed(REDACTED)
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

/// A process-wide (really: per-run) set of literal values that must never
/// appear verbatim in logs or captured stderr, populated from allow-listed,
/// sensitive-named imported environment variables at expansion time.
#[derive(Debug, Default, Clone)]
pub struct ValueRedactor {
    values: HashSet<String>,
}

impl ValueRedactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` for scrubbing if `name` looks sensitive. Short
    /// values (fewer than 4 bytes) are skipped — redacting them would
    /// scrub innocuous substrings throughout unrelated output.
    pub fn register(&mut self, name: &str, value: &str) {
        if key_looks_sensitive(name) && value.len() >= 4 {
            self.values.insert(value.to_string());
        }
    }

    pub fn register_env(&mut self, env: &std::collections::HashMap<String, String>) {
        for (key, value) in env {
            self.register(key, value);
        }
    }

    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            out = out.replace(value.as_str(), REDACTED);
        }
        out
    }

    #[must_use]
    pub fn scrub_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.scrub(text).into_bytes(),
            Err(_) => bytes.to_vec(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_key_patterns_are_case_insensitive() {
        assert!(key_looks_sensitive("DB_PASSWORD"));
        assert!(key_looks_sensitive("ApiKey"));
        assert!(key_looks_sensitive("X-Auth-Token"));
        assert!(!key_looks_sensitive("HOSTNAME"));
    }

    #[test]
    fn redact_pair_only_touches_sensitive_keys() {
        assert_eq!(redact_pair("PASSWORD", "hunter2"), "***REDACTED***");
        assert_eq!(redact_pair("LANG", "en_US.UTF-8"), "en_US.UTF-8");
    }

    #[test]
    fn value_redactor_scrubs_registered_secret_wherever_it_appears() {
        let mut redactor = ValueRedactor::new();
        redactor.register("API_TOKEN", "sk-deadbeef1234");
        let scrubbed = redactor.scrub("request failed, token sk-deadbeef1234 rejected");
        assert!(!scrubbed.contains("sk-deadbeef1234"));
        assert!(scrubbed.contains("***REDACTED***"));
    }

    #[test]
    fn value_redactor_skips_short_values() {
        let mut redactor = ValueRedactor::new();
        redactor.register("TOKEN", "ab");
        assert!(redactor.is_empty());
    }

    #[test]
    fn value_redactor_ignores_non_sensitive_names() {
        let mut redactor = ValueRedactor::new();
        redactor.register("HOSTNAME", "build-worker-07");
        assert!(redactor.is_empty());
    }
}
