use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::diff::ContextDiff;

/// A flat (top-level) mapping of shared state.
pub type Payload = Map<String, Value>;

/// Per-context monotonic version number. The first accepted write is 1.
pub type VersionId = u64;

/// One accepted write. Immutable once created; shared as `Arc<ContextVersion>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextVersion {
    pub version: VersionId,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_from_previous: Option<ContextDiff>,
    pub serialized_size: usize,
}

impl ContextVersion {
    /// Build a version, deriving hash and size from the payload.
    pub fn new(version: VersionId, payload: Payload, diff_from_previous: Option<ContextDiff>) -> Self {
        Self {
            version,
            timestamp: Utc::now(),
            content_hash: content_hash(&payload),
            serialized_size: serialized_size(&payload),
            payload,
            diff_from_previous,
        }
    }
}

/// Length in bytes of the compact JSON serialization.
pub fn serialized_size(payload: &Payload) -> usize {
    serde_json::to_string(payload).map_or(0, |s| s.len())
}

/// Hex SHA-256 of the canonical serialization. Key order does not matter.
pub fn content_hash(payload: &Payload) -> String {
    let canonical = canonicalize_map(payload);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

fn canonicalize_map(map: &Payload) -> Payload {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), canonicalize(v)))
        .collect()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonicalize_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn hash_ignores_key_order() {
        let a = payload(json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let b = payload(json!({"b": {"y": 2, "x": 1}, "a": 1}));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_differs_for_different_values() {
        let a = payload(json!({"a": 1}));
        let b = payload(json!({"a": 2}));
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = content_hash(&Payload::new());
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn serialized_size_matches_compact_json() {
        let p = payload(json!({"a": 1}));
        assert_eq!(serialized_size(&p), r#"{"a":1}"#.len());
        assert_eq!(serialized_size(&Payload::new()), 2);
    }

    #[test]
    fn version_serializes_camel_case() {
        let v = ContextVersion::new(1, payload(json!({"a": 1})), None);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["contentHash"].is_string());
        assert!(json["serializedSize"].is_number());
        assert!(json.get("diffFromPrevious").is_none());
    }
}
