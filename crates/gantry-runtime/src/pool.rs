//! The bounded worker pool.

use crate::error::LoadError;
use crate::messages::{HostCallResult, WorkerMessage};
use crate::worker::{self, WorkerConfig, WorkerHandle};
use gantry_plugins::ValidatedPlugin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// How far above the policy heap ceiling the VM allocator sits. The enforcer
/// must observe a breach before the allocator hard-stops it.
const VM_HEADROOM: u64 = 2;

/// A worker that loaded successfully, holding its pool slot until dropped.
#[derive(Debug)]
pub struct LoadedWorker {
    pub handle: Arc<WorkerHandle>,
    pub outbox_rx: flume::Receiver<WorkerMessage>,
    pub host_reply_tx: flume::Sender<HostCallResult>,
    pub(crate) permit: OwnedSemaphorePermit,
}

/// Bounded pool of isolated workers.
///
/// At most `max` workers exist at once; loads past the bound queue on the
/// semaphore and fail with [`LoadError::Timeout`] when no slot frees up
/// within the load timeout. Each worker belongs to exactly one instance, and
/// recycling (after a configured number of handled operations) is a fresh
/// load that replaces the old worker.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    load_timeout: Duration,
    recycle_after_ops: u64,
    host_call_timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_workers: usize, load_timeout: Duration, recycle_after_ops: u64) -> Self {
        info!(max_workers, "worker pool created");
        Self {
            slots: Arc::new(Semaphore::new(max_workers.max(1))),
            load_timeout,
            recycle_after_ops,
            host_call_timeout: Duration::from_secs(5),
        }
    }

    /// Spawn a worker for a validated plugin and wait for it to prime.
    pub async fn load(&self, plugin: &ValidatedPlugin) -> Result<LoadedWorker, LoadError> {
        let permit = match tokio::time::timeout(
            self.load_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore never closes while the pool is alive.
            Ok(Err(_)) => return Err(LoadError::WorkerUnavailable),
            Err(_) => {
                warn!(plugin = %plugin.manifest.id, "no worker slot within load timeout");
                return Err(LoadError::Timeout);
            }
        };

        let entry_path = plugin.entry_point();
        let entry_source =
            std::fs::read_to_string(&entry_path).map_err(|e| LoadError::ValidationFailed {
                reason: format!("entry point {} unreadable: {e}", entry_path.display()),
            })?;

        let config = WorkerConfig {
            vm_memory_limit: (plugin.policy.max_heap_bytes.saturating_mul(VM_HEADROOM)) as usize,
            hook_interval: 4096,
            host_call_timeout: self.host_call_timeout,
        };

        let spawned = worker::spawn(plugin.manifest.id.clone(), entry_source, config)
            .map_err(|_| LoadError::WorkerUnavailable)?;

        // The worker primes its VM and loads the entry point off-thread; its
        // first message settles the load.
        let first = tokio::time::timeout(self.load_timeout, spawned.outbox_rx.recv_async()).await;
        match first {
            Ok(Ok(WorkerMessage::Ready)) => {
                debug!(plugin = %plugin.manifest.id, worker = %spawned.handle.id(), "worker loaded");
                Ok(LoadedWorker {
                    handle: Arc::new(spawned.handle),
                    outbox_rx: spawned.outbox_rx,
                    host_reply_tx: spawned.host_reply_tx,
                    permit,
                })
            }
            Ok(Ok(WorkerMessage::InitFailed { reason })) => {
                spawned.handle.force_kill();
                Err(LoadError::EntryPointCrash { reason })
            }
            Ok(Ok(other)) => {
                spawned.handle.force_kill();
                Err(LoadError::EntryPointCrash {
                    reason: format!("unexpected first message {other:?}"),
                })
            }
            Ok(Err(_)) => {
                // Outbox closed without a message: the thread died.
                Err(LoadError::EntryPointCrash {
                    reason: "worker exited before reporting".to_string(),
                })
            }
            Err(_) => {
                spawned.handle.force_kill();
                Err(LoadError::Timeout)
            }
        }
    }

    /// Whether a worker with this many handled operations is due for
    /// recycling. A policy knob bounding cumulative leak growth, not a
    /// correctness requirement.
    pub fn should_recycle(&self, ops_handled: u64) -> bool {
        self.recycle_after_ops > 0 && ops_handled >= self.recycle_after_ops
    }

    /// Free worker slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
