use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Canonical form of a JSON value: object keys sorted, no whitespace.
/// Digests computed over this form survive key-order differences between
/// otherwise identical service responses.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let items: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content hash of a taxon payload.
pub fn taxon_digest(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Fingerprint of the upstream hierarchy: root id plus the sorted child-id
/// set. Equal fingerprints mean the species set cannot have changed.
pub fn source_hash(root_id: i64, child_ids: &[i64]) -> String {
    let mut ids = child_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    sha256_hex(canonical_json(&json!({ "root": root_id, "childIds": ids })).as_bytes())
}
