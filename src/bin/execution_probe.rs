// =============================================================================
// execution-probe — end-to-end check of the live order path
// =============================================================================
//
// Submits a small limit BUY well below the best bid (so it cannot fill),
// waits, cancels it, and verifies that the execution-update artifact recorded
// the order id. Confirms signing, order placement, cancellation, and the
// lifecycle artifact in one pass without risking a fill.
//
// Usage:
//   execution-probe [--market KRW-BTC] [--notional-krw 5100]
//                   [--discount-pct 2.0] [--cancel-delay-ms 1500]
//
// Exit code 0 on a verified round trip, 1 on any failure.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use uptide_bot::engine::EXECUTION_ARTIFACT_PATH;
use uptide_bot::engine_config::EngineConfig;
use uptide_bot::execution::order_manager::{best_book_price, ExitParams, OrderManager};
use uptide_bot::tick_size;
use uptide_bot::types::OrderSide;
use uptide_bot::upbit::client::UpbitClient;

struct ProbeArgs {
    market: String,
    notional_krw: f64,
    discount_pct: f64,
    cancel_delay_ms: u64,
}

fn parse_args() -> Result<ProbeArgs, String> {
    let mut probe = ProbeArgs {
        market: "KRW-BTC".to_string(),
        notional_krw: 5_100.0,
        discount_pct: 2.0,
        cancel_delay_ms: 1_500,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--market" => {
                probe.market = args.next().ok_or("--market requires a value")?;
            }
            "--notional-krw" => {
                let value: f64 = args
                    .next()
                    .ok_or("--notional-krw requires a value")?
                    .parse()
                    .map_err(|_| "invalid --notional-krw value")?;
                if value <= 0.0 {
                    return Err("invalid --notional-krw value".to_string());
                }
                probe.notional_krw = value;
            }
            "--discount-pct" => {
                let value: f64 = args
                    .next()
                    .ok_or("--discount-pct requires a value")?
                    .parse()
                    .map_err(|_| "invalid --discount-pct value")?;
                if !(0.0..=50.0).contains(&value) {
                    return Err("invalid --discount-pct value".to_string());
                }
                probe.discount_pct = value;
            }
            "--cancel-delay-ms" => {
                let value: u64 = args
                    .next()
                    .ok_or("--cancel-delay-ms requires a value")?
                    .parse()
                    .map_err(|_| "invalid --cancel-delay-ms value")?;
                if value > 120_000 {
                    return Err("invalid --cancel-delay-ms value".to_string());
                }
                probe.cancel_delay_ms = value;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: execution-probe [--market KRW-BTC] [--notional-krw 5100] \
                     [--discount-pct 2.0] [--cancel-delay-ms 1500]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(probe)
}

fn artifact_contains(order_id: &str) -> bool {
    std::fs::read_to_string(EXECUTION_ARTIFACT_PATH)
        .map(|content| content.lines().any(|line| line.contains(order_id)))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let probe = match parse_args() {
        Ok(probe) => probe,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let config = EngineConfig::load("config/config.json").unwrap_or_else(|_| {
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        config
    });
    if config.access_key.is_empty() || config.secret_key.is_empty() {
        eprintln!("Missing API key/secret (config file or UPTIDE_ACCESS_KEY / UPTIDE_SECRET_KEY)");
        std::process::exit(1);
    }

    let client = Arc::new(UpbitClient::new(config.access_key, config.secret_key));

    // Price the probe below the best bid so it rests without filling.
    let orderbook = client
        .get_orderbook(&[probe.market.clone()])
        .await
        .context("orderbook fetch failed")?;
    let Some(best_bid) = best_book_price(&orderbook, OrderSide::Buy) else {
        eprintln!("Failed to read best bid for {}", probe.market);
        std::process::exit(1);
    };

    let limit_price =
        tick_size::round_down_to_tick(best_bid * (1.0 - probe.discount_pct / 100.0));
    if limit_price <= 0.0 {
        eprintln!("Calculated limit price is invalid");
        std::process::exit(1);
    }
    let volume = probe.notional_krw / limit_price;
    if volume <= 0.0 || !volume.is_finite() {
        eprintln!("Calculated volume is invalid");
        std::process::exit(1);
    }

    // No WS link: the probe exercises the REST path only.
    let orders = OrderManager::new(client.clone(), None, EXECUTION_ARTIFACT_PATH);

    let order_id = orders
        .submit(
            &probe.market,
            OrderSide::Buy,
            limit_price,
            volume,
            "ExecutionProbe",
            ExitParams::default(),
        )
        .await
        .context("probe order submission failed")?;

    println!(
        "Submitted probe order: {order_id} (market={}, price={limit_price}, volume={volume})",
        probe.market
    );

    if probe.cancel_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(probe.cancel_delay_ms)).await;
    }

    if orders.cancel(&order_id).await {
        println!("Cancelled probe order: {order_id}");
    } else {
        // A false return is fine as long as the order is terminal.
        let status = client.get_order(&order_id).await?;
        let state = status.get("state").and_then(|s| s.as_str()).unwrap_or("");
        if state != "done" && state != "cancel" {
            eprintln!("Probe order is not terminal after cancel attempt (state={state})");
            std::process::exit(1);
        }
        println!("Cancel returned false but order is terminal (state={state})");
    }

    if !artifact_contains(&order_id) {
        eprintln!("Execution artifact missing probe order id: {EXECUTION_ARTIFACT_PATH}");
        std::process::exit(1);
    }

    println!("Execution artifact updated: {EXECUTION_ARTIFACT_PATH}");
    Ok(())
}
