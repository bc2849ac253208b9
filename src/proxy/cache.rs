//! Content-addressed cache of proxied responses.
//!
//! Keys are SHA-256 fingerprints of the canonicalised request body (see
//! [`crate::rpc::fingerprint`]); values are the exact response bytes, so a
//! hit is byte-equal to the fresh reply it shadows. Only responses without
//! a JSON-RPC `error` member are stored. Concurrent misses may build
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    body: Vec<u8>,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, service_id: &str, fingerprint: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.get(&(service_id.to_string(), fingerprint.to_string()))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.body.clone())
    }

    pub fn put(&self, service_id: &str, fingerprint: &str, body: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            (service_id.to_string(), fingerprint.to_string()),
            Entry {
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every entry belonging to a service (definition changed or
    /// service removed).
    pub fn invalidate_service(&self, service_id: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|(sid, _), _| sid != service_id);
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "purged expired cache entries");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                cache.sweep();
            }
        });
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl_returns_identical_bytes() {
        let cache = ResponseCache::new();
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_vec();
        cache.put("svc", "fp", body.clone(), Duration::from_secs(60));
        assert_eq!(cache.get("svc", "fp"), Some(body));
    }

    #[test]
    fn miss_on_unknown_key_or_service() {
        let cache = ResponseCache::new();
        cache.put("svc", "fp", vec![1], Duration::from_secs(60));
        assert!(cache.get("svc", "other").is_none());
        assert!(cache.get("other", "fp").is_none());
    }

    #[test]
    fn zero_ttl_is_never_stored() {
        let cache = ResponseCache::new();
        cache.put("svc", "fp", vec![1], Duration::ZERO);
        assert!(cache.get("svc", "fp").is_none());
    }

    #[tokio::test]
    async fn entries_expire_and_sweep_removes_them() {
        let cache = ResponseCache::new();
        cache.put("svc", "fp", vec![1], Duration::from_millis(50));
        assert!(cache.get("svc", "fp").is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("svc", "fp").is_none());

        cache.sweep();
        let entries = cache.entries.lock().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn invalidate_service_is_scoped() {
        let cache = ResponseCache::new();
        cache.put("a", "fp", vec![1], Duration::from_secs(60));
        cache.put("b", "fp", vec![2], Duration::from_secs(60));
        cache.invalidate_service("a");
        assert!(cache.get("a", "fp").is_none());
        assert_eq!(cache.get("b", "fp"), Some(vec![2]));
    }
}
