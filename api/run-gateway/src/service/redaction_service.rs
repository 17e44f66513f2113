use serde_json::Value;

pub const MASK: &str = "***MASKED***";

const SENSITIVE_KEYS: [&str; 6] = ["password", "token", "key", "secret", "api_key", "authorization"];

/// Replaces credential-bearing fields with [`MASK`], recursively.
pub fn mask_credentials(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_sensitive(k) {
                        (k.clone(), Value::String(MASK.to_string()))
                    } else {
                        (k.clone(), mask_credentials(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_credentials).collect()),
        other => other.clone(),
    }
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_nested_credentials_case_insensitively() {
        let masked = mask_credentials(&json!({
            "tool": "github",
            "params": {"API_KEY": "sk-123", "query": "rust"},
            "headers": [{"Authorization": "Bearer abc"}],
            "password": "hunter2"
        }));
        assert_eq!(masked["tool"], "github");
        assert_eq!(masked["params"]["API_KEY"], MASK);
        assert_eq!(masked["params"]["query"], "rust");
        assert_eq!(masked["headers"][0]["Authorization"], MASK);
        assert_eq!(masked["password"], MASK);
    }

    #[test]
    fn leaves_scalars_untouched() {
        assert_eq!(mask_credentials(&json!("token")), json!("token"));
    }
}
