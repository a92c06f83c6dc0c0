use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::DynTaskQueue;
use crate::handler::TaskHandler;
use crate::processor::{ExecutionLimits, QueueProcessor};
use crate::routing::RoutingConfig;

/// How long finished tasks are kept and how often they are swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Retention {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// One [`QueueProcessor`] per configured queue, sharing a shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
    cleanup: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a processor for every queue in `routing`.
    pub fn start(
        queue: DynTaskQueue,
        handler: Arc<dyn TaskHandler>,
        routing: &RoutingConfig,
        limits: ExecutionLimits,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let workers = routing
            .queues
            .iter()
            .map(|settings| {
                let processor = QueueProcessor::new(
                    queue.clone(),
                    handler.clone(),
                    settings.clone(),
                    limits,
                );
                (settings.name.clone(), tokio::spawn(processor.run(rx.clone())))
            })
            .collect();

        Self {
            shutdown,
            workers,
            cleanup: None,
        }
    }

    /// Purges finished tasks older than the retention period on every cleanup tick.
    pub fn with_cleanup(mut self, queue: DynTaskQueue, retention: Retention) -> Self {
        let mut shutdown = self.shutdown.subscribe();
        self.cleanup = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.cleanup_interval());
            loop {
                tokio::select! {
                    biased;

                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match queue.purge_finished(retention.retention()).await {
                            Ok(deleted) if deleted > 0 => {
                                tracing::info!(deleted, "Purged finished tasks");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Task cleanup failed");
                            }
                            _ => {}
                        }
                    }
                }
            }
        }));
        self
    }

    /// Names of the queues being processed.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|(name, _)| name.as_str())
    }

    /// Signals every processor and waits for in-flight batches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(queue = %name, error = %e, "Queue processor panicked");
            }
        }
        if let Some(cleanup) = self.cleanup
            && let Err(e) = cleanup.await
        {
            tracing::error!(error = %e, "Task cleanup panicked");
        }
        tracing::info!("Worker pool stopped");
    }
}
