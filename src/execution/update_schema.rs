// =============================================================================
// Execution-update artifact schema
// =============================================================================
//
// Every order lifecycle event is appended as one JSON line to
// `logs/execution_updates_live.jsonl`. The schema is fixed; downstream
// tooling greps this file by order id. Sensitive keys are masked before any
// payload is logged.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, OrderStatus};

/// Source tags for artifact lines.
pub mod source {
    pub const LIVE_SUBMIT: &str = "live_submit";
    pub const LIVE_CANCEL: &str = "live_cancel";
    pub const LIVE_FALLBACK: &str = "live_fallback";
    pub const LIVE_WS: &str = "live_ws";
    pub const LIVE_REST: &str = "live_rest";
    pub const LIVE_DRAIN: &str = "live_drain";
}

/// One artifact line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub ts_ms: i64,
    pub source: String,
    pub event: String,
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_volume: f64,
    pub order_volume: f64,
    pub avg_price: f64,
    pub strategy_name: String,
    pub terminal: bool,
}

impl ExecutionUpdate {
    /// Serialise to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

const SENSITIVE_KEYS: &[&str] = &[
    "access_key",
    "secret_key",
    "authorization",
    "bearer",
    "jwt",
    "token",
    "api_key",
    "signature",
    "query_hash",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
}

/// Replace the value of every sensitive key in `node` (recursively) with
/// `"***"`.
pub fn mask_sensitive_json(node: &mut serde_json::Value) {
    match node {
        serde_json::Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *value = serde_json::Value::String("***".to_string());
                } else {
                    mask_sensitive_json(value);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                mask_sensitive_json(item);
            }
        }
        _ => {}
    }
}

/// Dump a payload for logging with sensitive values masked.
pub fn safe_dump(payload: &serde_json::Value) -> String {
    let mut copy = payload.clone();
    mask_sensitive_json(&mut copy);
    copy.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_schema_fields() {
        let update = ExecutionUpdate {
            ts_ms: 1_700_000_000_000,
            source: source::LIVE_SUBMIT.to_string(),
            event: "submitted".to_string(),
            order_id: "abc-123".to_string(),
            market: "KRW-BTC".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Submitted,
            filled_volume: 0.0,
            order_volume: 0.01,
            avg_price: 100_000.0,
            strategy_name: "Scalping".to_string(),
            terminal: false,
        };

        let line = update.to_jsonl();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["source"], "live_submit");
        assert_eq!(parsed["side"], "BUY");
        assert_eq!(parsed["status"], "SUBMITTED");
        assert_eq!(parsed["terminal"], false);
        assert_eq!(parsed["order_id"], "abc-123");
    }

    #[test]
    fn masking_replaces_sensitive_values() {
        let mut payload = serde_json::json!({
            "uuid": "abc",
            "access_key": "AK-SECRET",
            "nested": { "Authorization": "Bearer xyz", "price": "100" },
            "list": [{ "jwt": "token" }]
        });
        mask_sensitive_json(&mut payload);
        assert_eq!(payload["access_key"], "***");
        assert_eq!(payload["nested"]["Authorization"], "***");
        assert_eq!(payload["list"][0]["jwt"], "***");
        assert_eq!(payload["nested"]["price"], "100");
        assert_eq!(payload["uuid"], "abc");
    }

    #[test]
    fn safe_dump_does_not_mutate_original() {
        let payload = serde_json::json!({ "secret_key": "s" });
        let dumped = safe_dump(&payload);
        assert!(dumped.contains("***"));
        assert_eq!(payload["secret_key"], "s");
    }
}
