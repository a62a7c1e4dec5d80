// =============================================================================
// Private myOrder WebSocket stream
// =============================================================================
//
// Connects to wss://api.upbit.com/websocket/v1/private with a Bearer JWT
// upgrade header and subscribes to the `myOrder` feed. The exchange may send
// a single event object or an array of them; both shapes dispatch through the
// same handler.
//
// Reconnect policy: backoff of 2s × attempt capped at 30s; the attempt
// counter resets after any connection that stayed up for at least 60s.
// The link state (connected flag, last-message timestamp) is shared with the
// order manager, which uses it to decide when REST sync is needed.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::now_ms;
use crate::upbit::jwt;

const WS_URL: &str = "wss://api.upbit.com/websocket/v1/private";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// A connection that survives this long resets the reconnect counter.
const STABLE_CONNECTION_SECS: u64 = 60;
const MAX_BACKOFF_SECS: u64 = 30;

/// Shared view of the stream's health.
pub struct MyOrderLink {
    connected: AtomicBool,
    last_message_ms: AtomicI64,
}

impl MyOrderLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message_ms.load(Ordering::Relaxed)
    }

    fn mark_message(&self) {
        self.last_message_ms.store(now_ms(), Ordering::Relaxed);
    }
}

/// Run the stream forever, reconnecting with bounded backoff. Spawn as a
/// background task; it exits only when the task is dropped.
pub async fn run_my_order_stream<F>(
    access_key: String,
    secret_key: String,
    link: Arc<MyOrderLink>,
    handler: F,
) where
    F: Fn(&serde_json::Value) + Send + Sync,
{
    let mut reconnect_attempt: u32 = 0;

    loop {
        let connected_since = Instant::now();
        match connect_and_read(&access_key, &secret_key, &link, &handler).await {
            Ok(()) => {
                reconnect_attempt = 0;
            }
            Err(e) => {
                link.connected.store(false, Ordering::Relaxed);
                if connected_since.elapsed().as_secs() >= STABLE_CONNECTION_SECS {
                    reconnect_attempt = 0;
                } else {
                    reconnect_attempt += 1;
                }
                let backoff = (2 * reconnect_attempt as u64).min(MAX_BACKOFF_SECS);
                warn!(error = %e, retry_in_secs = backoff, "myOrder WS disconnected");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
    }
}

async fn connect_and_read<F>(
    access_key: &str,
    secret_key: &str,
    link: &Arc<MyOrderLink>,
    handler: &F,
) -> Result<()>
where
    F: Fn(&serde_json::Value) + Send + Sync,
{
    let token = jwt::generate(access_key, secret_key, &BTreeMap::new());
    let mut request = WS_URL
        .into_client_request()
        .context("failed to build WS request")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .context("bad authorization header")?,
    );

    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
        .await
        .context("myOrder WS handshake timed out")?
        .context("myOrder WS handshake failed")?;

    let subscribe = serde_json::json!([
        { "ticket": Uuid::new_v4().to_string() },
        { "type": "myOrder" },
        { "format": "DEFAULT" },
    ]);
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .context("myOrder WS subscribe failed")?;

    link.connected.store(true, Ordering::Relaxed);
    link.mark_message();
    info!("myOrder WS connected");

    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, ws.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                // Keep-alive probe; the next read failing ends the session.
                ws.send(Message::Ping(Vec::new()))
                    .await
                    .context("myOrder WS idle ping failed")?;
                continue;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                link.mark_message();
                dispatch_payload(text.as_bytes(), handler);
            }
            Some(Ok(Message::Binary(bytes))) => {
                link.mark_message();
                dispatch_payload(&bytes, handler);
            }
            Some(Ok(Message::Ping(payload))) => {
                link.mark_message();
                ws.send(Message::Pong(payload))
                    .await
                    .context("myOrder WS pong failed")?;
            }
            Some(Ok(Message::Pong(_))) => {
                link.mark_message();
            }
            Some(Ok(Message::Close(_))) | None => {
                link.connected.store(false, Ordering::Relaxed);
                anyhow::bail!("myOrder WS closed by server");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                link.connected.store(false, Ordering::Relaxed);
                return Err(e).context("myOrder WS read failed");
            }
        }
    }
}

/// Parse one frame and dispatch each contained event object. The exchange may
/// deliver a single object or an array of objects.
fn dispatch_payload<F>(payload: &[u8], handler: &F)
where
    F: Fn(&serde_json::Value),
{
    let message: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse myOrder WS message");
            return;
        }
    };

    match &message {
        serde_json::Value::Array(items) => {
            for item in items {
                if item.is_object() {
                    handler(item);
                }
            }
        }
        serde_json::Value::Object(_) => handler(&message),
        other => debug!(kind = ?other, "ignoring non-object myOrder frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect_dispatched(payload: &[u8]) -> Vec<serde_json::Value> {
        let seen = Mutex::new(Vec::new());
        dispatch_payload(payload, &|v: &serde_json::Value| {
            seen.lock().unwrap().push(v.clone());
        });
        seen.into_inner().unwrap()
    }

    #[test]
    fn dispatches_single_object() {
        let seen = collect_dispatched(br#"{"type":"myOrder","state":"done"}"#);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["state"], "done");
    }

    #[test]
    fn dispatches_each_element_of_array() {
        let seen =
            collect_dispatched(br#"[{"state":"trade"},{"state":"done"},"noise"]"#);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["state"], "trade");
        assert_eq!(seen[1]["state"], "done");
    }

    #[test]
    fn malformed_payload_dispatches_nothing() {
        assert!(collect_dispatched(b"not json").is_empty());
        assert!(collect_dispatched(b"42").is_empty());
    }

    #[test]
    fn link_starts_disconnected() {
        let link = MyOrderLink::new();
        assert!(!link.is_connected());
        assert_eq!(link.last_message_ms(), 0);
        link.mark_message();
        assert!(link.last_message_ms() > 0);
    }
}
