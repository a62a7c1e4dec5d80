// =============================================================================
// Shared types used across the Uptide trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which environment the engine trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    /// Real orders against the exchange.
    Live,
    /// Full pipeline, no orders leave the process.
    Paper,
    /// Candle replay through the backtest harness.
    Backtest,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Paper => write!(f, "PAPER"),
            Self::Backtest => write!(f, "BACKTEST"),
        }
    }
}

/// Order direction. Upbit's wire format calls these `bid` / `ask`; logs and
/// the execution artifact use `BUY` / `SELL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Wire representation used by the exchange (`bid` for buys, `ask` for
    /// sells).
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Buy => "bid",
            Self::Sell => "ask",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Internal order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Coarse market regime attached to signals and recorded on positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    Unknown,
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::TrendingUp => write!(f, "TRENDING_UP"),
            Self::TrendingDown => write!(f, "TRENDING_DOWN"),
            Self::Ranging => write!(f, "RANGING"),
            Self::HighVolatility => write!(f, "HIGH_VOLATILITY"),
        }
    }
}

/// Milliseconds since the Unix epoch, wall clock. Used for log/artifact
/// timestamps; interval comparisons use `std::time::Instant` instead.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse a JSON field that may be either a string or a number into `f64`.
/// Upbit returns volumes and prices as strings on most endpoints.
pub fn json_number(value: &serde_json::Value, key: &str) -> f64 {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn side_wire_format() {
        assert_eq!(OrderSide::Buy.as_wire(), "bid");
        assert_eq!(OrderSide::Sell.as_wire(), "ask");
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
    }

    #[test]
    fn json_number_parses_strings_and_numbers() {
        let v: serde_json::Value =
            serde_json::json!({ "a": "1.5", "b": 2.5, "c": "", "d": null });
        assert_eq!(json_number(&v, "a"), 1.5);
        assert_eq!(json_number(&v, "b"), 2.5);
        assert_eq!(json_number(&v, "c"), 0.0);
        assert_eq!(json_number(&v, "d"), 0.0);
        assert_eq!(json_number(&v, "missing"), 0.0);
    }
}
