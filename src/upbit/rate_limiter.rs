// =============================================================================
// Per-group rate limiter — token buckets over 1-second windows
// =============================================================================
//
// Upbit enforces per-second quotas by endpoint group:
//   quotation groups (market/candle/ticker/orderbook/trade)  10 req/s per IP
//   accounts                                                  30 req/s per key
//   order                                                      8 req/s per key
//   default                                                   30 req/s
//
// `acquire` blocks (async) until a token is available; waits are bounded to
// the next window edge (window start + 1s + 1ms). A 429 response installs a
// 1-second global block, a 418 a 60-second block. All sleeping happens with
// the state lock released, and no ordering among waiters is guaranteed.
//
// `Remaining-Req` response headers are reconciled conservatively: the local
// count only ever advances toward the server's view, never relaxes.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Slack added past the window edge before retrying.
const WINDOW_SLACK: Duration = Duration::from_millis(1);

struct Bucket {
    max_per_second: u32,
    current_count: u32,
    window_start: Instant,
}

struct Inner {
    buckets: HashMap<&'static str, Bucket>,
    block_until: Option<Instant>,
    total_requests: u64,
    rejected_requests: u64,
    forced_waits: u64,
}

/// Counters snapshot for the shutdown performance block.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub forced_waits: u64,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
}

/// Outcome of one non-sleeping pass over the bucket state.
enum Attempt {
    Acquired,
    WaitUntil(Instant),
}

impl RateLimiter {
    pub fn new() -> Self {
        let now = Instant::now();
        let mut buckets = HashMap::new();
        for group in ["market", "candle", "ticker", "orderbook", "trade"] {
            buckets.insert(group, Bucket { max_per_second: 10, current_count: 0, window_start: now });
        }
        buckets.insert("accounts", Bucket { max_per_second: 30, current_count: 0, window_start: now });
        buckets.insert("order", Bucket { max_per_second: 8, current_count: 0, window_start: now });
        buckets.insert("default", Bucket { max_per_second: 30, current_count: 0, window_start: now });

        info!("rate limiter initialised with exchange per-second quotas");

        Self {
            inner: Mutex::new(Inner {
                buckets,
                block_until: None,
                total_requests: 0,
                rejected_requests: 0,
                forced_waits: 0,
            }),
        }
    }

    /// Acquire one token for `group`, waiting as long as necessary. Unknown
    /// groups fall back to `default`.
    pub async fn acquire(&self, group: &str) {
        loop {
            let attempt = {
                let mut inner = self.inner.lock();
                Self::try_take(&mut inner, group, Instant::now())
            };
            match attempt {
                Attempt::Acquired => return,
                Attempt::WaitUntil(deadline) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.forced_waits += 1;
                    }
                    let now = Instant::now();
                    if deadline > now {
                        tokio::time::sleep(deadline - now).await;
                    }
                }
            }
        }
    }

    /// Non-blocking variant: returns `false` instead of waiting.
    pub fn try_acquire(&self, group: &str) -> bool {
        let mut inner = self.inner.lock();
        match Self::try_take(&mut inner, group, Instant::now()) {
            Attempt::Acquired => true,
            Attempt::WaitUntil(_) => {
                inner.rejected_requests += 1;
                false
            }
        }
    }

    fn try_take(inner: &mut Inner, group: &str, now: Instant) -> Attempt {
        // 1. Global block (429/418) gates every group.
        if let Some(until) = inner.block_until {
            if now < until {
                return Attempt::WaitUntil(until);
            }
            inner.block_until = None;
            info!("rate-limit global block released");
        }

        let key = if inner.buckets.contains_key(group) { group } else { "default" };
        let bucket = inner.buckets.get_mut(key).expect("default bucket always present");

        // 2. Window reset after >= 1000 ms.
        if now.duration_since(bucket.window_start) >= Duration::from_secs(1) {
            bucket.current_count = 0;
            bucket.window_start = now;
        }

        // 3. Token available?
        if bucket.current_count < bucket.max_per_second {
            bucket.current_count += 1;
            inner.total_requests += 1;
            return Attempt::Acquired;
        }

        // 4. Exhausted: wake just past the next window edge.
        Attempt::WaitUntil(bucket.window_start + Duration::from_secs(1) + WINDOW_SLACK)
    }

    /// Reconcile from a `Remaining-Req: group=<g>; min=<m>; sec=<n>` header.
    /// The count only advances toward the server's view.
    pub fn update_from_header(&self, header: &str) {
        let (Some(group), Some(sec)) = parse_remaining_req(header) else {
            return;
        };

        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(group.as_str()) {
            let used_remote = bucket.max_per_second.saturating_sub(sec);
            if used_remote > bucket.current_count {
                debug!(
                    group = %group,
                    local = bucket.current_count,
                    remote_used = used_remote,
                    "advancing bucket count from Remaining-Req header"
                );
                bucket.current_count = used_remote;
            }
        }
    }

    /// Install the global block mandated by a 429 or 418 response.
    pub fn handle_rate_limit_status(&self, status: u16) {
        let duration = match status {
            429 => Duration::from_secs(1),
            418 => Duration::from_secs(60),
            _ => return,
        };

        let mut inner = self.inner.lock();
        let until = Instant::now() + duration;
        let extend = match inner.block_until {
            Some(existing) => until > existing,
            None => true,
        };
        if extend {
            inner.block_until = Some(until);
            warn!(status, block_secs = duration.as_secs(), "rate-limit block installed");
        }
    }

    /// Remaining tokens in the current window for `group`.
    pub fn remaining(&self, group: &str) -> u32 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let key = if inner.buckets.contains_key(group) { group } else { "default" };
        let bucket = inner.buckets.get_mut(key).expect("default bucket always present");
        if now.duration_since(bucket.window_start) >= Duration::from_secs(1) {
            bucket.current_count = 0;
            bucket.window_start = now;
        }
        bucket.max_per_second.saturating_sub(bucket.current_count)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let inner = self.inner.lock();
        RateLimiterStats {
            total_requests: inner.total_requests,
            rejected_requests: inner.rejected_requests,
            forced_waits: inner.forced_waits,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `group=<g>; min=<m>; sec=<n>` into `(group, sec_remaining)`.
pub fn parse_remaining_req(header: &str) -> (Option<String>, Option<u32>) {
    let mut group = None;
    let mut sec = None;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("group=") {
            group = Some(value.trim().to_string());
        } else if let Some(value) = part.strip_prefix("sec=") {
            sec = value.trim().parse::<u32>().ok();
        }
    }
    (group, sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_requests_within_one_window() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.try_acquire("ticker"));
        }
        // 11th request in the same window is refused.
        assert!(!limiter.try_acquire("ticker"));
        // Other groups are unaffected.
        assert!(limiter.try_acquire("order"));
    }

    #[test]
    fn order_group_allows_eight_per_second() {
        let limiter = RateLimiter::new();
        for _ in 0..8 {
            assert!(limiter.try_acquire("order"));
        }
        assert!(!limiter.try_acquire("order"));
    }

    #[test]
    fn unknown_group_uses_default_bucket() {
        let limiter = RateLimiter::new();
        for _ in 0..30 {
            assert!(limiter.try_acquire("mystery"));
        }
        assert!(!limiter.try_acquire("mystery"));
        // "mystery" consumed the default bucket.
        assert_eq!(limiter.remaining("default"), 0);
    }

    #[test]
    fn header_reconciliation_is_conservative() {
        let limiter = RateLimiter::new();
        assert!(limiter.try_acquire("ticker")); // local count = 1

        // Server says 3 remaining of 10 -> used 7 > 1, advance.
        limiter.update_from_header("group=ticker; min=57; sec=3");
        assert_eq!(limiter.remaining("ticker"), 3);

        // Server says 9 remaining -> used 1 < 7, never relax.
        limiter.update_from_header("group=ticker; min=57; sec=9");
        assert_eq!(limiter.remaining("ticker"), 3);
    }

    #[test]
    fn http_429_blocks_all_groups() {
        let limiter = RateLimiter::new();
        limiter.handle_rate_limit_status(429);
        assert!(!limiter.try_acquire("ticker"));
        assert!(!limiter.try_acquire("accounts"));
    }

    #[test]
    fn non_rate_limit_status_is_ignored() {
        let limiter = RateLimiter::new();
        limiter.handle_rate_limit_status(500);
        assert!(limiter.try_acquire("ticker"));
    }

    #[tokio::test]
    async fn blocked_acquire_returns_after_block_expires() {
        let limiter = RateLimiter::new();
        limiter.handle_rate_limit_status(429);

        let start = Instant::now();
        limiter.acquire("ticker").await;
        // The 1-second block must have been honoured (with a little slack for
        // the window edge).
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn parse_remaining_req_header() {
        assert_eq!(
            parse_remaining_req("group=market; min=57; sec=9"),
            (Some("market".to_string()), Some(9))
        );
        assert_eq!(parse_remaining_req("sec=2"), (None, Some(2)));
        assert_eq!(parse_remaining_req("garbage"), (None, None));
    }

    #[test]
    fn stats_count_rejections() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.try_acquire("ticker");
        }
        limiter.try_acquire("ticker");
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.rejected_requests, 1);
    }
}
