// =============================================================================
// Upbit exchange plumbing: signed REST client, rate limiter, private stream
// =============================================================================

pub mod client;
pub mod jwt;
pub mod my_order_ws;
pub mod rate_limiter;
