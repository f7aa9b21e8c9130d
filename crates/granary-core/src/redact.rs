//! Sensitive-field redaction for logged configuration.

use serde_json::Value;

use crate::JsonMap;

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "api_key",
    "apikey",
    "authorization",
];

/// Returns a copy of `values` with sensitive fields masked as `***`.
///
/// Key matching is case-insensitive. Null values stay null so that redaction
/// never invents a credential where none was configured.
pub fn redact_config(values: &JsonMap) -> JsonMap {
    let mut redacted = JsonMap::new();
    for (key, value) in values {
        let lowered = key.to_lowercase();
        if SENSITIVE_KEYS.contains(&lowered.as_str()) && !value.is_null() {
            redacted.insert(key.clone(), Value::String("***".to_string()));
        } else {
            redacted.insert(key.clone(), value.clone());
        }
    }
    redacted
}

/// Renders a config map as a single log-safe string.
pub fn redacted_display(values: &JsonMap) -> String {
    serde_json::to_string(&redact_config(values)).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn masks_sensitive_keys() {
        let config = map(&[
            ("host", json!("db.internal")),
            ("password", json!("hunter2")),
            ("token", json!("abc")),
        ]);
        let redacted = redact_config(&config);
        assert_eq!(redacted["host"], json!("db.internal"));
        assert_eq!(redacted["password"], json!("***"));
        assert_eq!(redacted["token"], json!("***"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let config = map(&[("Password", json!("x")), ("API_KEY", json!("y"))]);
        let redacted = redact_config(&config);
        assert_eq!(redacted["Password"], json!("***"));
        assert_eq!(redacted["API_KEY"], json!("***"));
    }

    #[test]
    fn null_secrets_stay_null() {
        let config = map(&[("password", Value::Null)]);
        let redacted = redact_config(&config);
        assert_eq!(redacted["password"], Value::Null);
    }

    #[test]
    fn display_is_valid_json() {
        let config = map(&[("secret", json!("s")), ("port", json!(5432))]);
        let rendered = redacted_display(&config);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["secret"], json!("***"));
        assert_eq!(parsed["port"], json!(5432));
    }
}
