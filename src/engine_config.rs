// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable of the engine lives here. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
//
// API keys may come from the config file or be overridden via the
// UPTIDE_ACCESS_KEY / UPTIDE_SECRET_KEY environment variables; the env wins.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_initial_capital() -> f64 {
    1_000_000.0
}

fn default_scan_interval_seconds() -> u64 {
    60
}

fn default_min_volume_krw() -> f64 {
    5_000_000_000.0
}

fn default_max_positions() -> usize {
    5
}

fn default_max_daily_trades() -> u32 {
    20
}

fn default_max_drawdown() -> f64 {
    0.10
}

fn default_max_daily_loss_krw() -> f64 {
    50_000.0
}

fn default_max_daily_loss_pct() -> f64 {
    0.05
}

fn default_max_order_krw() -> f64 {
    500_000.0
}

fn default_min_order_krw() -> f64 {
    5_000.0
}

fn default_fee_rate() -> f64 {
    0.0005
}

fn default_order_fee_reserve_pct() -> f64 {
    0.001
}

fn default_max_new_orders_per_scan() -> u32 {
    2
}

fn default_reentry_cooldown_seconds() -> i64 {
    300
}

fn default_small_account_tier1_capital_krw() -> f64 {
    60_000.0
}

fn default_small_account_tier2_capital_krw() -> f64 {
    100_000.0
}

fn default_small_account_tier1_max_order_pct() -> f64 {
    0.20
}

fn default_small_account_tier2_max_order_pct() -> f64 {
    0.15
}

fn default_hostility_ewma_alpha() -> f64 {
    0.14
}

fn default_hostility_hostile_threshold() -> f64 {
    0.62
}

fn default_hostility_severe_threshold() -> f64 {
    0.82
}

fn default_hostility_extreme_threshold() -> f64 {
    0.88
}

fn default_enabled_strategies() -> Vec<String> {
    vec![
        "Scalping".to_string(),
        "Momentum".to_string(),
        "Breakout".to_string(),
        "MeanReversion".to_string(),
        "GridTrading".to_string(),
    ]
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Uptide engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Mode -----------------------------------------------------------------
    #[serde(default)]
    pub mode: TradingMode,

    /// LIVE safety valve: when set, signed orders are logged but never sent.
    #[serde(default)]
    pub dry_run: bool,

    // --- Capital & scan -------------------------------------------------------
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,

    /// Minimum 24h traded value for a market to be scanned (KRW).
    #[serde(default = "default_min_volume_krw")]
    pub min_volume_krw: f64,

    // --- Risk limits ----------------------------------------------------------
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    /// Maximum drawdown fraction before new entries are refused.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    #[serde(default = "default_max_daily_loss_krw")]
    pub max_daily_loss_krw: f64,

    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Per-market cooldown between consecutive entries (seconds). The
    /// backtest harness sets this to 0.
    #[serde(default = "default_reentry_cooldown_seconds")]
    pub reentry_cooldown_seconds: i64,

    // --- Order sizing ---------------------------------------------------------
    #[serde(default = "default_max_order_krw")]
    pub max_order_krw: f64,

    /// Exchange minimum notional per order (KRW).
    #[serde(default = "default_min_order_krw")]
    pub min_order_krw: f64,

    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Extra reserve applied by the small-seed correction so that fee and
    /// rounding can never push an order back under the exchange minimum.
    #[serde(default = "default_order_fee_reserve_pct")]
    pub order_fee_reserve_pct: f64,

    #[serde(default = "default_max_new_orders_per_scan")]
    pub max_new_orders_per_scan: u32,

    // --- Small-account tiers --------------------------------------------------
    // Present for config-file compatibility; the engine applies only the
    // min_order_krw-derived correction (see DESIGN.md).
    #[serde(default = "default_small_account_tier1_capital_krw")]
    pub small_account_tier1_capital_krw: f64,

    #[serde(default = "default_small_account_tier2_capital_krw")]
    pub small_account_tier2_capital_krw: f64,

    #[serde(default = "default_small_account_tier1_max_order_pct")]
    pub small_account_tier1_max_order_pct: f64,

    #[serde(default = "default_small_account_tier2_max_order_pct")]
    pub small_account_tier2_max_order_pct: f64,

    // --- Hostility thresholds -------------------------------------------------
    // Defined but consumed by no engine path; kept for config compatibility.
    #[serde(default = "default_hostility_ewma_alpha")]
    pub hostility_ewma_alpha: f64,

    #[serde(default = "default_hostility_hostile_threshold")]
    pub hostility_hostile_threshold: f64,

    #[serde(default = "default_hostility_severe_threshold")]
    pub hostility_severe_threshold: f64,

    #[serde(default = "default_hostility_extreme_threshold")]
    pub hostility_extreme_threshold: f64,

    // --- Strategies -----------------------------------------------------------
    #[serde(default = "default_enabled_strategies")]
    pub enabled_strategies: Vec<String>,

    // --- API keys -------------------------------------------------------------
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`, then apply environment
    /// overrides for the API keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.apply_env_overrides();

        info!(
            path = %path.display(),
            mode = %config.mode,
            initial_capital = config.initial_capital,
            scan_interval = config.scan_interval_seconds,
            max_positions = config.max_positions,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// UPTIDE_ACCESS_KEY / UPTIDE_SECRET_KEY override the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("UPTIDE_ACCESS_KEY") {
            if !key.is_empty() {
                self.access_key = key;
            }
        }
        if let Ok(key) = std::env::var("UPTIDE_SECRET_KEY") {
            if !key.is_empty() {
                self.secret_key = key;
            }
        }
    }

    /// Startup validation — missing keys in LIVE mode are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.mode == TradingMode::Live && (self.access_key.is_empty() || self.secret_key.is_empty())
        {
            anyhow::bail!("LIVE mode requires access_key and secret_key");
        }
        if self.initial_capital <= 0.0 {
            anyhow::bail!("initial_capital must be positive");
        }
        if self.min_order_krw <= 0.0 || self.max_order_krw < self.min_order_krw {
            anyhow::bail!("order size bounds are inconsistent");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.mode, TradingMode::Paper);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.initial_capital, 1_000_000.0);
        assert_eq!(cfg.scan_interval_seconds, 60);
        assert_eq!(cfg.max_positions, 5);
        assert_eq!(cfg.max_daily_trades, 20);
        assert_eq!(cfg.min_order_krw, 5_000.0);
        assert!((cfg.fee_rate - 0.0005).abs() < f64::EPSILON);
        assert_eq!(cfg.enabled_strategies.len(), 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "LIVE", "initial_capital": 250000.0 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, TradingMode::Live);
        assert_eq!(cfg.initial_capital, 250_000.0);
        assert_eq!(cfg.max_order_krw, 500_000.0);
        assert_eq!(cfg.reentry_cooldown_seconds, 300);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.max_positions, cfg2.max_positions);
        assert_eq!(cfg.enabled_strategies, cfg2.enabled_strategies);
    }

    #[test]
    fn validate_rejects_live_without_keys() {
        let mut cfg = EngineConfig::default();
        cfg.mode = TradingMode::Live;
        assert!(cfg.validate().is_err());
        cfg.access_key = "a".into();
        cfg.secret_key = "s".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_order_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.max_order_krw = 1_000.0; // below min_order_krw
        assert!(cfg.validate().is_err());
    }
}
