//! Safe-to-print config snapshots: secret fields are masked.

use serde_json::Value;

const SENSITIVE_KEYS: &[&str] = &["apiKey", "api_key", "token", "accessToken", "secret", "password"];

/// Replace every sensitive string with its first four characters and `***`.
pub fn redact(value: &Value) -> Value {
    redact_recursive(value, "")
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

fn redact_recursive(value: &Value, key: &str) -> Value {
    match value {
        Value::String(s) if is_sensitive_key(key) && !s.is_empty() => {
            let hint: String = s.chars().take(4).collect();
            if s.chars().count() > 4 {
                Value::String(format!("{hint}***"))
            } else {
                Value::String("***".to_string())
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_recursive(v, key)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_recursive(v, k)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_planner_key_only() {
        let v = json!({
            "agent": {"plannerEndpoint": "https://planner.local", "apiKey": "sk-live-123456"},
            "budget": {"maxTokens": 100000}
        });
        let r = redact(&v);
        assert_eq!(r["agent"]["apiKey"], "sk-l***");
        assert_eq!(r["agent"]["plannerEndpoint"], "https://planner.local");
        assert_eq!(r["budget"]["maxTokens"], 100000);
    }

    #[test]
    fn short_secrets_fully_masked() {
        let r = redact(&json!({"token": "abc"}));
        assert_eq!(r["token"], "***");
    }
}
