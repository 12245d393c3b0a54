//! Secret redaction for anything that leaves the broker.
//!
//! Two layers:
//! - [`redact_environment`] masks every value of a provider environment for
//!   display, keeping key names visible.
//! - [`SecretScrubber`] removes known secret values from free text and JSON
//!   (provider output, error messages, audit summaries). Values shorter than
//!   [`MIN_SECRET_LEN`] are not matched; `DEBUG=1` would otherwise rewrite
//!   every `1` in every reply.

use std::collections::BTreeMap;

use aho_corasick::{AhoCorasick, MatchKind};
use serde_json::Value;

use crate::registry::Environment;

/// Replacement for a secret found inside free text.
pub const REDACTED: &str = "[REDACTED]";

/// Mask character for environment values.
const MASK_CHAR: char = '*';

/// Display copy of an environment: same keys, values masked to their length.
pub fn redact_environment(env: &Environment) -> BTreeMap<String, String> {
    env.iter_exposed()
        .map(|(key, value)| (key.to_string(), mask(value)))
        .collect()
}

fn mask(value: &str) -> String {
    std::iter::repeat_n(MASK_CHAR, value.chars().count()).collect()
}

/// Values shorter than this are configuration, not credentials.
pub const MIN_SECRET_LEN: usize = 4;

/// Values that render like JSON literals and never carry a credential.
const LITERAL_VALUES: &[&str] = &["true", "false", "null"];

/// Whether an environment value is treated as a secret.
fn is_secret_value(value: &str) -> bool {
    let value = value.trim();
    value.chars().count() >= MIN_SECRET_LEN
        && !LITERAL_VALUES.iter().any(|l| value.eq_ignore_ascii_case(l))
}

/// Fast multi-pattern matcher over every known secret value.
#[derive(Debug, Clone)]
pub struct SecretScrubber {
    matcher: Option<AhoCorasick>,
    /// Set when the matcher could not be built; all text is withheld.
    withhold_all: bool,
}

impl SecretScrubber {
    /// A scrubber that leaves everything untouched.
    pub fn empty() -> Self {
        Self {
            matcher: None,
            withhold_all: false,
        }
    }

    /// Build from the values of every given environment.
    pub fn from_environments<'a>(envs: impl IntoIterator<Item = &'a Environment>) -> Self {
        let mut secrets: Vec<&str> = envs
            .into_iter()
            .flat_map(|env| env.iter_exposed().map(|(_, v)| v))
            .filter(|v| is_secret_value(v))
            .collect();
        // Longest first so a secret that contains another is replaced whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();

        if secrets.is_empty() {
            return Self::empty();
        }

        match AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&secrets)
        {
            Ok(matcher) => Self {
                matcher: Some(matcher),
                withhold_all: false,
            },
            Err(e) => {
                // Only possible if the automaton exceeds its size limits.
                tracing::error!("Failed to build secret scrubber: {}", e);
                Self {
                    matcher: None,
                    withhold_all: true,
                }
            }
        }
    }

    /// Whether the text contains any known secret.
    pub fn contains_secret(&self, text: &str) -> bool {
        self.withhold_all || self.matcher.as_ref().is_some_and(|m| m.is_match(text))
    }

    /// Replace every known secret in `text`.
    pub fn scrub(&self, text: &str) -> String {
        if self.withhold_all {
            return REDACTED.to_string();
        }
        match &self.matcher {
            Some(matcher) => {
                let replacements = vec![REDACTED; matcher.patterns_len()];
                matcher.replace_all(text, &replacements)
            }
            None => text.to_string(),
        }
    }

    /// Replace every known secret in the strings and scalars of a JSON value.
    ///
    /// Object keys are structure, not data, and are left alone.
    pub fn scrub_value(&self, value: &mut Value) {
        self.scrub_value_keeping(value, &[]);
    }

    /// Like [`scrub_value`](Self::scrub_value), but string values stored
    /// under any of `keep` are broker-owned identifiers and stay as they are.
    pub fn scrub_value_keeping(&self, value: &mut Value, keep: &[&str]) {
        if self.matcher.is_none() && !self.withhold_all {
            return;
        }
        match value {
            Value::String(s) => {
                if self.contains_secret(s) {
                    *s = self.scrub(s);
                }
            }
            Value::Number(_) | Value::Bool(_) => {
                // A numeric secret (PIN=4242) arrives unquoted.
                if self.contains_secret(&value.to_string()) {
                    *value = Value::String(REDACTED.to_string());
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.scrub_value_keeping(item, keep);
                }
            }
            Value::Object(map) => {
                for (key, item) in map.iter_mut() {
                    if item.is_string() && keep.contains(&key.as_str()) {
                        continue;
                    }
                    self.scrub_value_keeping(item, keep);
                }
            }
            Value::Null => {}
        }
    }
}

impl Default for SecretScrubber {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let mut env = Environment::new();
        for (k, v) in pairs {
            env.insert(*k, *v);
        }
        env
    }

    #[test]
    fn test_redact_preserves_keys_and_length() {
        let redacted = redact_environment(&env(&[("API_KEY", "abcdef"), ("EMPTY", "")]));

        assert_eq!(redacted.get("API_KEY").map(String::as_str), Some("******"));
        assert_eq!(redacted.get("EMPTY").map(String::as_str), Some(""));
    }

    #[test]
    fn test_redact_counts_chars_not_bytes() {
        let redacted = redact_environment(&env(&[("TOKEN", "çé")]));
        assert_eq!(redacted.get("TOKEN").map(String::as_str), Some("**"));
    }

    #[test]
    fn test_scrub_text() {
        let a = env(&[("API_KEY", "sk-live-123")]);
        let b = env(&[("DB_PASS", "hunter22")]);
        let scrubber = SecretScrubber::from_environments([&a, &b]);

        let out = scrubber.scrub("auth sk-live-123 failed; pass=hunter22");
        assert_eq!(out, "auth [REDACTED] failed; pass=[REDACTED]");
        assert!(!scrubber.contains_secret(&out));
    }

    #[test]
    fn test_scrub_prefers_longest_secret() {
        let a = env(&[("SHORT", "abcd"), ("LONG", "abcdefgh")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        assert_eq!(scrubber.scrub("xabcdefghx"), "x[REDACTED]x");
        assert_eq!(scrubber.scrub("xabcdx"), "x[REDACTED]x");
    }

    #[test]
    fn test_scrub_json_value() {
        let a = env(&[("API_KEY", "sk-live-123")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        let mut value = serde_json::json!({
            "text": "key is sk-live-123",
            "nested": [{"token": "sk-live-123"}, "ok"],
            "n": 42
        });
        scrubber.scrub_value(&mut value);

        assert_eq!(value["text"], "key is [REDACTED]");
        assert_eq!(value["nested"][0]["token"], REDACTED);
        assert_eq!(value["n"], 42);
        assert_eq!(value["nested"][1], "ok");
    }

    #[test]
    fn test_short_and_literal_values_are_not_secrets() {
        let a = env(&[("DEBUG", "1"), ("VERBOSE", "true"), ("MODE", "dev")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        let mut value = serde_json::json!({
            "alias": "weather1",
            "tools": [{"name": "get_1"}],
            "count1": true,
            "mode": "dev-server"
        });
        let before = value.clone();
        scrubber.scrub_value(&mut value);

        assert_eq!(value, before);
        assert_eq!(scrubber.scrub("DEBUG=1 in dev"), "DEBUG=1 in dev");
    }

    #[test]
    fn test_object_keys_are_never_rewritten() {
        let a = env(&[("API_KEY", "sk-live-123")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        let mut value = serde_json::json!({"sk-live-123": "sk-live-123"});
        scrubber.scrub_value(&mut value);

        assert_eq!(value, serde_json::json!({"sk-live-123": REDACTED}));
    }

    #[test]
    fn test_numeric_secrets_are_scrubbed() {
        let a = env(&[("PIN", "4242")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        let mut value = serde_json::json!({"pin": 4242, "account": 9942420, "days": 3, "ok": true});
        scrubber.scrub_value(&mut value);

        assert_eq!(value["pin"], REDACTED);
        assert_eq!(value["account"], REDACTED);
        assert_eq!(value["days"], 3);
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_kept_fields_survive() {
        let a = env(&[("CITY", "oslo")]);
        let scrubber = SecretScrubber::from_environments([&a]);

        let mut value = serde_json::json!({
            "providers": [{"alias": "oslo-weather", "description": "weather for oslo"}]
        });
        scrubber.scrub_value_keeping(&mut value, &["alias"]);

        assert_eq!(value["providers"][0]["alias"], "oslo-weather");
        assert_eq!(value["providers"][0]["description"], "weather for [REDACTED]");
    }

    #[test]
    fn test_empty_scrubber_is_identity() {
        let scrubber = SecretScrubber::empty();
        assert_eq!(scrubber.scrub("anything"), "anything");
    }
}
