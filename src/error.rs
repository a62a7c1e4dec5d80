// =============================================================================
// Classified exchange errors
// =============================================================================
//
// Recovery policy per kind:
//   NetworkTransient    — retry with backoff
//   RateLimited         — enter the limiter's global block
//   ExchangeReject      — degrade the compliance adapter, skip the order
//   ComplianceViolation — degrade the compliance adapter, skip the signal
//   StateInconsistency  — reconcile via authoritative REST state
//   ConfigInvalid       — fatal at startup
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport-level failure (DNS, TLS, connect, timeout).
    #[error("network transient: {0}")]
    NetworkTransient(String),

    /// HTTP 429 (per-second quota) or 418 (IP ban window).
    #[error("rate limited: HTTP {status}")]
    RateLimited { status: u16 },

    /// The exchange accepted the request but refused the order.
    #[error("exchange reject: {0}")]
    ExchangeReject(String),

    /// A pre-trade compliance rule failed.
    #[error("compliance violation: {0}")]
    ComplianceViolation(String),

    /// Local state disagrees with the exchange; REST is authoritative.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    /// Bad configuration — refuse to start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl ExchangeError {
    /// Classify an HTTP status + body into an error kind.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 | 418 => Self::RateLimited { status },
            400..=499 => Self::ExchangeReject(format!("HTTP {status}: {body}")),
            _ => Self::NetworkTransient(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkTransient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            ExchangeError::from_status(429, ""),
            ExchangeError::RateLimited { status: 429 }
        ));
        assert!(matches!(
            ExchangeError::from_status(418, ""),
            ExchangeError::RateLimited { status: 418 }
        ));
        assert!(matches!(
            ExchangeError::from_status(400, "bad order"),
            ExchangeError::ExchangeReject(_)
        ));
        assert!(matches!(
            ExchangeError::from_status(502, ""),
            ExchangeError::NetworkTransient(_)
        ));
    }
}
