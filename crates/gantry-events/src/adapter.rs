//! Source supervision: run every backend, degrade on persistent failure.

use crate::traits::{DeviceSource, EventSender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Health of one supervised source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    /// Running and delivering.
    Healthy,
    /// Failed recently; being restarted with backoff.
    Retrying,
    /// Retry budget exhausted; source abandoned, pipeline degraded.
    Degraded,
    /// Finished cleanly (only injection sources do this).
    Finished,
}

/// Owns the configured sources and keeps them running.
///
/// One supervisor task per source: on failure the source is restarted with
/// exponential backoff; once the consecutive-failure budget is spent the
/// source is marked degraded and abandoned while the remaining sources keep
/// the pipeline alive. Losing every source degrades delivery but never
/// crashes the process.
pub struct AdapterSet {
    sources: Vec<Arc<dyn DeviceSource>>,
    max_retries: u32,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            max_retries: 5,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DeviceSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_retry_budget(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Spawn one supervisor per source, all feeding `tx`.
    pub fn spawn(self, tx: EventSender) -> AdapterHandle {
        let health: Arc<Mutex<HashMap<String, SourceHealth>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = Vec::with_capacity(self.sources.len());

        for source in self.sources {
            let name = source.name().to_string();
            health.lock().insert(name.clone(), SourceHealth::Healthy);

            let tx = tx.clone();
            let health = Arc::clone(&health);
            let max_retries = self.max_retries;

            tasks.push(tokio::spawn(async move {
                let mut failures = 0u32;
                loop {
                    health.lock().insert(name.clone(), SourceHealth::Healthy);
                    match source.run(tx.clone()).await {
                        Ok(()) => {
                            info!(source = %name, "source finished");
                            health.lock().insert(name.clone(), SourceHealth::Finished);
                            return;
                        }
                        Err(e) => {
                            failures += 1;
                            if failures > max_retries {
                                error!(
                                    source = %name,
                                    "source failed {failures} times, degrading: {e}"
                                );
                                health.lock().insert(name.clone(), SourceHealth::Degraded);
                                return;
                            }
                            let backoff =
                                Duration::from_millis(250u64.saturating_mul(1 << failures.min(7)));
                            warn!(
                                source = %name,
                                attempt = failures,
                                "source failed, retrying in {backoff:?}: {e}"
                            );
                            health.lock().insert(name.clone(), SourceHealth::Retrying);
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }));
        }

        AdapterHandle { health, tasks }
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle onto the running supervisors.
pub struct AdapterHandle {
    health: Arc<Mutex<HashMap<String, SourceHealth>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AdapterHandle {
    /// Per-source health snapshot for the readiness query.
    pub fn health(&self) -> HashMap<String, SourceHealth> {
        self.health.lock().clone()
    }

    /// True while at least one source is healthy or retrying.
    pub fn any_delivering(&self) -> bool {
        self.health
            .lock()
            .values()
            .any(|h| matches!(h, SourceHealth::Healthy | SourceHealth::Retrying))
    }

    /// Abort every supervisor (daemon shutdown).
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
