//! Cache keys for cacheable tools.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable key for `(tool_name, params)`.
///
/// serde_json maps are key-sorted, so objects that differ only in key order
/// hash identically.
pub fn default_cache_key(tool_name: &str, params: &Value) -> String {
    let raw = format!("{}|{}", tool_name, params);
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_params_share_key() {
        let a = default_cache_key("transcript", &json!({"video_id": "v1", "language": "en"}));
        let b = default_cache_key("transcript", &json!({"language": "en", "video_id": "v1"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn different_tool_or_params_differ() {
        let params = json!({"video_id": "v1"});
        assert_ne!(
            default_cache_key("transcript", &params),
            default_cache_key("topic_clusters", &params)
        );
        assert_ne!(
            default_cache_key("transcript", &params),
            default_cache_key("transcript", &json!({"video_id": "v2"}))
        );
    }
}
