//! The reverse-proxy request path: routing, rate limiting, caching, and the
//! WebSocket bridge.

pub mod cache;
pub mod rate_limit;
pub mod router;
pub mod ws;

pub use cache::ResponseCache;
pub use rate_limit::{client_key, RateLimitDecision, RateLimiter};
