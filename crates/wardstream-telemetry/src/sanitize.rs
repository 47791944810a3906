//! Redaction of sensitive fields before reports are queued

use serde_json::Value;

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "authorization",
    "cookie",
    "api_key",
    "apikey",
    "private_key",
    "credential",
];

/// Whether a property name should be redacted.
///
/// Matches case-insensitively on the fragments above, plus the bare name
/// `key`.
pub fn is_sensitive_key(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "key" || SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Redacts sensitive properties in place, recursing through objects and
/// arrays. Returns the number of values redacted.
pub fn sanitize(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut redacted = 0;
            for (name, child) in map.iter_mut() {
                if is_sensitive_key(name) {
                    if !child.is_null() {
                        *child = Value::String(REDACTED.to_string());
                        redacted += 1;
                    }
                } else {
                    redacted += sanitize(child);
                }
            }
            redacted
        }
        Value::Array(items) => items.iter_mut().map(sanitize).sum(),
        _ => 0,
    }
}

/// Returns a sanitized copy
pub fn sanitized(value: &Value) -> Value {
    let mut copy = value.clone();
    sanitize(&mut copy);
    copy
}
