//! Secret redaction for captured tool input and output.
//!
//! Every match is replaced with a typed placeholder (`[REDACTED:<kind>]`) so the
//! reader can still see that something was there and what shape it had.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

use crate::utils::Utils;

/// Ordered most specific first: a later, broader pattern never sees text an
/// earlier one already replaced.
static SECRET_PATTERNS: Lazy<Vec<SecretPattern>> = Lazy::new(|| {
    vec![
        SecretPattern::new(
            "private_key",
            r"-----BEGIN (?:[A-Z]+ )*PRIVATE KEY-----[\s\S]*?(?:-----END (?:[A-Z]+ )*PRIVATE KEY-----|\z)",
        ),
        SecretPattern::new("bearer_token", r"(?i)\bbearer\s+[A-Za-z0-9_\-.=+/]{8,}"),
        SecretPattern::new("anthropic_api_key", r"\bsk-ant-[A-Za-z0-9\-_]{20,}"),
        SecretPattern::new("api_key", r"\bsk-[A-Za-z0-9\-_]{20,}"),
        SecretPattern::new("aws_access_key", r"\bAKIA[A-Z0-9]{16}\b"),
        SecretPattern::new("github_token", r"\bgh[pousr]_[A-Za-z0-9_]{36,}"),
        SecretPattern::new(
            "slack_token",
            r"\bxox[baprs]-[0-9]{10,}-[0-9]{10,}-[A-Za-z0-9]{24,}",
        ),
        SecretPattern::new(
            "api_key",
            r#"(?i)\b(?:api[_-]?key|access[_-]?token|auth[_-]?token|secret[_-]?key)["']?\s*[:=]\s*["']?[A-Za-z0-9_\-.]{16,}["']?"#,
        ),
        SecretPattern::new(
            "password",
            r#"(?i)\b(?:password|passwd|pwd)["']?\s*[:=]\s*(?:"[^"]*"|'[^']*'|[^\s,;&]+)"#,
        ),
    ]
});

struct SecretPattern {
    placeholder: String,
    regex: Regex,
}

impl SecretPattern {
    fn new(kind: &'static str, pattern: &str) -> Self {
        Self {
            placeholder: format!("[REDACTED:{}]", kind),
            regex: Regex::new(pattern).expect("invalid secret pattern"),
        }
    }
}

/// Replace every known secret shape in `text` with its typed placeholder
pub fn redact(text: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(text);

    for pattern in SECRET_PATTERNS.iter() {
        if pattern.regex.is_match(&result) {
            let replaced = pattern
                .regex
                .replace_all(&result, pattern.placeholder.as_str())
                .into_owned();
            result = Cow::Owned(replaced);
        }
    }

    result
}

/// Redact, then cap at `max_chars` characters.
///
/// Redacting first means a secret straddling the cap is never left half-visible.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    Utils::truncate_chars(&redact(text), max_chars)
}
