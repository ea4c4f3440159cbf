//! Request fingerprinting for idempotency.

use serde_json::json;
use sha2::{Digest, Sha256};

/// Deterministic 64-hex-char fingerprint over the request components
/// that define "the same request": feature key, endpoint, method,
/// payload hash and the optional usage estimate. Endpoint and method
/// are normalized (lowercase / uppercase) so trivial casing differences
/// do not defeat idempotency.
pub fn create_request_fingerprint(
    feature_key: &str,
    endpoint: &str,
    method: &str,
    payload_hash: &str,
    usage_estimate: Option<&serde_json::Value>,
) -> String {
    // Canonical representation; serde_json serializes map keys in
    // sorted order, so the output is deterministic.
    let canonical = json!({
        "endpoint": endpoint.to_lowercase(),
        "feature_key": feature_key,
        "method": method.to_uppercase(),
        "payload_hash": payload_hash,
        "usage_estimate": usage_estimate,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
