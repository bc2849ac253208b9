//! Registry of live supervisors, keyed by service id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::log_buffer::LogBuffer;
use super::supervisor::Supervisor;
use crate::error::GatewayError;
use crate::registry::{DesiredStatus, Registry, ServiceDefinition};

/// Global deadline for shutting the whole fleet down.
const STOP_ALL_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceCounts {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

pub struct ProcessManager {
    supervisors: RwLock<HashMap<String, Arc<Supervisor>>>,
    logs: Arc<LogBuffer>,
}

impl ProcessManager {
    pub fn new(logs: Arc<LogBuffer>) -> Self {
        Self {
            supervisors: RwLock::new(HashMap::new()),
            logs,
        }
    }

    pub fn logs(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.logs)
    }

    /// Construct a supervisor for a definition. Fails if the id is taken.
    pub async fn add(&self, def: ServiceDefinition) -> Result<Arc<Supervisor>, GatewayError> {
        let mut map = self.supervisors.write().await;
        if map.contains_key(&def.id) {
            return Err(GatewayError::Conflict(format!(
                "service '{}' already has a supervisor",
                def.id
            )));
        }
        let sup = Supervisor::new(def.clone(), Arc::clone(&self.logs));
        map.insert(def.id.clone(), Arc::clone(&sup));
        Ok(sup)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Supervisor>> {
        self.supervisors.read().await.get(id).cloned()
    }

    /// Stop a supervisor and drop it from the registry.
    pub async fn remove(&self, id: &str) -> Result<(), GatewayError> {
        let sup = {
            let mut map = self.supervisors.write().await;
            map.remove(id)
        };
        match sup {
            Some(sup) => {
                sup.stop().await?;
                self.logs.clear(id);
                Ok(())
            }
            None => Err(GatewayError::NotFound),
        }
    }

    /// Concurrently stop every supervisor, bounded by a global deadline.
    pub async fn stop_all(&self) {
        let sups: Vec<Arc<Supervisor>> = {
            let map = self.supervisors.read().await;
            map.values().cloned().collect()
        };
        if sups.is_empty() {
            return;
        }

        info!(count = sups.len(), "stopping all services");
        let stops = sups.iter().map(|sup| {
            let sup = Arc::clone(sup);
            async move {
                if let Err(e) = sup.stop().await {
                    warn!(service = %sup.definition().id, "stop failed: {e}");
                }
            }
        });
        if tokio::time::timeout(STOP_ALL_DEADLINE, futures::future::join_all(stops))
            .await
            .is_err()
        {
            warn!("global stop deadline elapsed with services still stopping");
        }
    }

    /// Boot-time recovery: build a supervisor per persisted definition and
    /// start those whose recorded intent is `running`. Failures are logged,
    /// never fatal.
    pub async fn boot(&self, registry: &Registry) -> Result<(), GatewayError> {
        for def in registry.list_services()? {
            let desired = def.desired_status;
            let id = def.id.clone();
            let sup = match self.add(def).await {
                Ok(sup) => sup,
                Err(e) => {
                    warn!(service = %id, "could not register supervisor: {e}");
                    continue;
                }
            };
            if desired == DesiredStatus::Running {
                info!(service = %id, "recovering desired status: running");
                if let Err(e) = sup.start().await {
                    warn!(service = %id, "failed to start at boot: {e}");
                }
            }
        }
        Ok(())
    }

    pub async fn counts(&self) -> ServiceCounts {
        let map = self.supervisors.read().await;
        let total = map.len();
        let running = map
            .values()
            .filter(|sup| sup.state().is_running())
            .count();
        ServiceCounts {
            total,
            running,
            stopped: total - running,
        }
    }
}
