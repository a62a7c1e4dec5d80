// =============================================================================
// Uptide — main entry point
// =============================================================================
//
// Startup sequence: environment, logging, config, connectivity check, engine.
// The engine shuts down cooperatively on Ctrl+C. BACKTEST mode fetches recent
// candles for the scanned universe, replays them through the harness, and
// exits.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uptide_bot::backtest::BacktestEngine;
use uptide_bot::engine::TradingEngine;
use uptide_bot::engine_config::EngineConfig;
use uptide_bot::scanner::MarketScanner;
use uptide_bot::types::TradingMode;
use uptide_bot::upbit::client::UpbitClient;

const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Uptide Trading Engine — Starting             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match EngineConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path, error = %e, "config load failed; using defaults + env");
            let mut config = EngineConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    // Configuration or key failures are fatal at startup (exit code 1).
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return Err(e);
    }

    info!(
        mode = %config.mode,
        dry_run = config.dry_run,
        initial_capital = config.initial_capital,
        scan_interval_s = config.scan_interval_seconds,
        max_positions = config.max_positions,
        strategies = ?config.enabled_strategies,
        "configuration loaded"
    );

    // ── 3. Exchange client & connectivity check ──────────────────────────
    let client = Arc::new(UpbitClient::new(
        config.access_key.clone(),
        config.secret_key.clone(),
    ));

    let markets = client
        .get_markets()
        .await
        .context("exchange connectivity check failed")?;
    let krw_count = markets
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("market")?.as_str())
                .filter(|name| name.starts_with("KRW-"))
                .count()
        })
        .unwrap_or(0);
    info!(krw_markets = krw_count, "exchange reachable");

    // ── 4. Backtest mode: replay and exit ────────────────────────────────
    if config.mode == TradingMode::Backtest {
        return run_backtest(config, client).await;
    }

    // ── 5. Live / paper engine ───────────────────────────────────────────
    let engine = TradingEngine::new(config, client);
    engine
        .clone()
        .start()
        .await
        .context("engine startup failed")?;

    info!("engine running — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    engine.stop().await;
    info!("Uptide shut down complete");
    Ok(())
}

/// Fetch recent candles for the scanned universe and replay them.
async fn run_backtest(config: EngineConfig, client: Arc<UpbitClient>) -> anyhow::Result<()> {
    info!("BACKTEST mode: fetching candle history for the liquid universe");

    let scanner = MarketScanner::new(client.clone(), config.min_volume_krw);
    let scanned = scanner.scan_markets().await.context("backtest scan failed")?;

    let mut candles_by_market = HashMap::new();
    for metrics in &scanned {
        if metrics.candles.len() > 40 {
            candles_by_market.insert(metrics.market.clone(), metrics.candles.clone());
        }
    }

    if candles_by_market.is_empty() {
        warn!("no markets with enough history; nothing to replay");
        return Ok(());
    }

    let harness = BacktestEngine::new(config);
    let report = harness.run(&candles_by_market)?;

    info!(
        trades = report.metrics.total_trades,
        win_rate = report.metrics.win_rate * 100.0,
        profit_factor = report.metrics.profit_factor,
        sharpe = report.metrics.sharpe_ratio,
        max_drawdown = report.metrics.max_drawdown * 100.0,
        total_pnl = report.metrics.total_pnl,
        "backtest report"
    );
    Ok(())
}
