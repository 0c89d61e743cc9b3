//! Redaction of secrets from diagnostics that leave the core.

use std::sync::OnceLock;

use regex::Regex;

struct RedactionRule {
    pattern: Regex,
    replacement: &'static str,
}

fn rules() -> &'static [RedactionRule] {
    static RULES: OnceLock<Vec<RedactionRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)bearer\s+[a-zA-Z0-9\-._~+/]+=*", "Bearer [REDACTED]"),
            (
                r"(?i)\b(api[_-]?key|token|secret|password|passwd)\s*[=:]\s*[^\s,;&]+",
                "$1=[REDACTED]",
            ),
            (r"\b(AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED_ACCESS_KEY]"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern)
                .ok()
                .map(|pattern| RedactionRule {
                    pattern,
                    replacement,
                })
        })
        .collect()
    })
}

/// Replace bearer tokens, `key=value` secrets and cloud access keys.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for rule in rules() {
        if rule.pattern.is_match(&out) {
            out = rule.pattern.replace_all(&out, rule.replacement).into_owned();
        }
    }
    out
}
