//! Fixed-window rate limiting per (service, client).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tracing::debug;

use crate::error::GatewayError;

/// Window length. Limits in service definitions are per this window.
pub const WINDOW: Duration = Duration::from_secs(60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Successful admission: becomes the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub limit: u32,
    pub remaining: u32,
    /// Window end as absolute monotonic milliseconds (process epoch).
    pub reset_ms: u128,
}

struct Window {
    count: u32,
    window_end: Instant,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Count one request and admit it while `count <= limit`.
    pub fn check(
        &self,
        service_id: &str,
        client_key: &str,
        limit: u32,
    ) -> Result<RateLimitDecision, GatewayError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let window = windows
            .entry((service_id.to_string(), client_key.to_string()))
            .or_insert_with(|| Window {
                count: 0,
                window_end: now + WINDOW,
            });

        if window.window_end <= now {
            window.count = 0;
            window.window_end = now + WINDOW;
        }

        window.count += 1;
        let reset_ms = window.window_end.duration_since(self.epoch).as_millis();

        if window.count <= limit {
            Ok(RateLimitDecision {
                limit,
                remaining: limit - window.count,
                reset_ms,
            })
        } else {
            let retry_after = window
                .window_end
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            Err(GatewayError::RateLimited {
                retry_after_secs: retry_after,
                limit,
                reset_ms,
            })
        }
    }

    /// Drop expired windows.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let before = windows.len();
        windows.retain(|_, w| w.window_end > now);
        let swept = before - windows.len();
        if swept > 0 {
            debug!(swept, "purged expired rate-limit windows");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.sweep();
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the client key: trusted forwarded-for header, then real-ip, then
/// the connection's remote address.
pub fn client_key(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for i in 0..3 {
            let d = limiter.check("svc", "1.2.3.4", 3).unwrap();
            assert_eq!(d.limit, 3);
            assert_eq!(d.remaining, 3 - (i + 1));
        }
        let err = limiter.check("svc", "1.2.3.4", 3).unwrap_err();
        match err {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs >= 1 && retry_after_secs <= 60),
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[test]
    fn clients_are_counted_independently() {
        let limiter = RateLimiter::new();
        limiter.check("svc", "a", 1).unwrap();
        assert!(limiter.check("svc", "a", 1).is_err());
        assert!(limiter.check("svc", "b", 1).is_ok());
        assert!(limiter.check("other", "a", 1).is_ok());
    }

    #[test]
    fn remaining_plus_served_equals_limit() {
        let limiter = RateLimiter::new();
        for served in 1..=5u32 {
            let d = limiter.check("svc", "c", 5).unwrap();
            assert_eq!(d.remaining + served, d.limit);
        }
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("svc", "a", 0).is_err());
    }

    #[test]
    fn sweep_drops_only_expired_windows() {
        let limiter = RateLimiter::new();
        limiter.check("svc", "a", 10).unwrap();
        limiter.sweep();
        // Window still live; counter preserved.
        let d = limiter.check("svc", "a", 10).unwrap();
        assert_eq!(d.remaining, 8);
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(remote)), "10.0.0.1");

        headers.remove("x-forwarded-for");
        assert_eq!(client_key(&headers, Some(remote)), "10.0.0.2");

        headers.remove("x-real-ip");
        assert_eq!(client_key(&headers, Some(remote)), "127.0.0.1");
        assert_eq!(client_key(&headers, None), "unknown");
    }
}
