use std::path::PathBuf;
use std::sync::Arc;

use crate::proxy::cache::ResponseCache;
use crate::proxy::rate_limit::RateLimiter;
use crate::registry::Registry;
use crate::supervisor::{LogBuffer, ProcessManager};

/// Shared handles threaded through every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub manager: Arc<ProcessManager>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>) -> Self {
        let log_dir = registry.log_dir().map(PathBuf::from);
        let logs = Arc::new(LogBuffer::new(1_000, log_dir));
        Self {
            registry,
            manager: Arc::new(ProcessManager::new(logs)),
            limiter: Arc::new(RateLimiter::new()),
            cache: Arc::new(ResponseCache::new()),
        }
    }

    pub fn logs(&self) -> Arc<LogBuffer> {
        self.manager.logs()
    }
}
