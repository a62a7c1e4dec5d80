// =============================================================================
// Upbit JWT generation — HS256, per-request nonce, SHA-512 query hash
// =============================================================================
//
// Every signed request carries `Authorization: Bearer <jwt>`. The payload is
// `{access_key, nonce, timestamp}` plus, when the request has query or body
// parameters, `query_hash` = SHA-512 hex of the canonical `k=v&k=v` string
// and `query_hash_alg = "SHA512"`. The canonical string must be built from
// the same key-ordered parameter sequence used on the wire.
// =============================================================================

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

use crate::types::now_ms;

type HmacSha256 = Hmac<Sha256>;

/// Canonical `k=v&k=v` string over key-ordered params.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// SHA-512 hex digest of the canonical query string.
pub fn query_hash(params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha512::new();
    hasher.update(canonical_query(params).as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a signed JWT for one request. `params` covers both query-string
/// and order-body parameters; pass an empty map for parameterless endpoints.
pub fn generate(access_key: &str, secret_key: &str, params: &BTreeMap<String, String>) -> String {
    let header = serde_json::json!({ "alg": "HS256", "typ": "JWT" });

    let mut payload = serde_json::json!({
        "access_key": access_key,
        "nonce": Uuid::new_v4().to_string(),
        "timestamp": now_ms(),
    });
    if !params.is_empty() {
        payload["query_hash"] = serde_json::Value::String(query_hash(params));
        payload["query_hash_alg"] = serde_json::Value::String("SHA512".to_string());
    }

    let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
    let message = format!("{header_b64}.{payload_b64}");

    let mut mac =
        HmacSha256::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(message.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{message}.{signature_b64}")
}
