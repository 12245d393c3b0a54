//! Safety layer for data leaving the broker.
//!
//! Provider environments hold API keys and tokens. Nothing that reaches the
//! agent (descriptor views, tool output, error messages, audit summaries)
//! may carry one of those values in plaintext.

mod redactor;

pub use redactor::{REDACTED, SecretScrubber, redact_environment};

/// Keep at most `max` characters from the start of `s` (char-aware).
pub fn truncate_head(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Keep at most `max` bytes from the end of `s`, on a char boundary.
pub fn truncate_tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
