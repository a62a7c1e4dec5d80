// =============================================================================
// cancel-order — report an order's state and cancel it if still live
// =============================================================================
//
// Usage: cancel-order <order_uuid> [config_path]
//
// Exit code 0 when the order is (or becomes) terminal, 1 on any failure.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use uptide_bot::engine_config::EngineConfig;
use uptide_bot::upbit::client::{CancelOutcome, UpbitClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(order_uuid) = args.next() else {
        eprintln!("Usage: cancel-order <order_uuid> [config_path]");
        std::process::exit(1);
    };
    let config_path = args
        .next()
        .unwrap_or_else(|| "config/config.json".to_string());

    let config = EngineConfig::load(&config_path).unwrap_or_else(|_| {
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        config
    });
    if config.access_key.is_empty() || config.secret_key.is_empty() {
        eprintln!("Missing API key/secret (config file or UPTIDE_ACCESS_KEY / UPTIDE_SECRET_KEY)");
        std::process::exit(1);
    }

    let client = Arc::new(UpbitClient::new(config.access_key, config.secret_key));

    let status = client
        .get_order(&order_uuid)
        .await
        .context("order lookup failed")?;
    let state = status.get("state").and_then(|s| s.as_str()).unwrap_or("unknown");
    println!("Current state: {state}");

    if state == "done" || state == "cancel" {
        println!("Order already terminal; no cancel needed");
        return Ok(());
    }

    match client.cancel_order(&order_uuid).await? {
        CancelOutcome::Cancelled(payload) => {
            let uuid = payload.get("uuid").and_then(|u| u.as_str()).unwrap_or("");
            println!("Cancel accepted: {uuid}");
            Ok(())
        }
        CancelOutcome::AlreadyTerminal(state) => {
            let state = state.get("state").and_then(|s| s.as_str()).unwrap_or("unknown");
            println!("Order reached terminal state before cancel: {state}");
            Ok(())
        }
        CancelOutcome::Rejected(reason) => {
            eprintln!("Cancel rejected: {reason}");
            std::process::exit(1);
        }
    }
}
