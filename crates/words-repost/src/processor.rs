//! Background processor for one named queue.
//!
//! Polls the queue, runs claimed tasks with bounded concurrency and turns each
//! handler result into complete, retry or fail.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::context::DynTaskQueue;
use crate::error::{QueueError, TaskError};
use crate::handler::TaskHandler;
use crate::routing::{MAX_RETRY_DELAY, QueueSettings};
use crate::task::TaskEnvelope;

/// Time limits applied to every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// A task running longer is cancelled and treated as a transient failure.
    #[serde(default = "default_task_time_limit_secs")]
    pub task_time_limit_secs: u64,
    /// How long a claimed task stays owned by this worker.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_task_time_limit_secs() -> u64 {
    60
}

fn default_lease_secs() -> u64 {
    300
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            task_time_limit_secs: default_task_time_limit_secs(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl ExecutionLimits {
    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.task_time_limit_secs == 0 {
            return Err("queue.task_time_limit_secs must be greater than 0".into());
        }
        if self.lease_secs <= self.task_time_limit_secs {
            return Err("queue.lease_secs must exceed queue.task_time_limit_secs".into());
        }
        Ok(())
    }
}

/// Processes one queue until shut down.
pub struct QueueProcessor {
    queue: DynTaskQueue,
    handler: Arc<dyn TaskHandler>,
    settings: QueueSettings,
    task_time_limit: Duration,
    lease: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue: DynTaskQueue,
        handler: Arc<dyn TaskHandler>,
        settings: QueueSettings,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            queue,
            handler,
            settings,
            task_time_limit: limits.task_time_limit(),
            lease: limits.lease(),
        }
    }

    /// Override the per-task time limit.
    pub fn with_task_time_limit(mut self, limit: Duration) -> Self {
        self.task_time_limit = limit;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.name
    }

    /// Run until the shutdown signal flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = %self.settings.name,
            concurrency = self.settings.concurrency,
            "Starting queue processor"
        );

        loop {
            let processed = match self.process_batch().await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(queue = %self.settings.name, error = %e, "Failed to claim tasks");
                    0
                }
            };

            // Drain a busy queue without waiting for the next poll.
            if processed > 0 && !*shutdown.borrow() {
                continue;
            }

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    match result {
                        Ok(()) if *shutdown.borrow() => {
                            tracing::info!(queue = %self.settings.name, "Queue processor shutting down");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => {
                            tracing::info!(queue = %self.settings.name, "Queue processor shutdown channel closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
    }

    /// Claims and runs one batch. Returns the number of tasks claimed.
    pub async fn process_batch(&self) -> Result<usize, QueueError> {
        let tasks = self
            .queue
            .claim(&self.settings.name, self.settings.concurrency, self.lease)
            .await?;
        let claimed = tasks.len();
        if claimed == 0 {
            return Ok(0);
        }

        tracing::debug!(queue = %self.settings.name, count = claimed, "Processing tasks");

        stream::iter(tasks)
            .for_each_concurrent(self.settings.concurrency, |task| self.execute(task))
            .await;

        Ok(claimed)
    }

    async fn execute(&self, task: TaskEnvelope) {
        let result = match tokio::time::timeout(self.task_time_limit, self.handler.handle(&task))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::retryable(format!(
                "task exceeded time limit of {:?}",
                self.task_time_limit
            ))),
        };

        if let Err(e) = self.apply_outcome(&task, result).await {
            tracing::error!(
                task_id = %task.id,
                task_name = %task.name,
                error = %e,
                "Failed to record task outcome"
            );
        }
    }

    async fn apply_outcome(
        &self,
        task: &TaskEnvelope,
        result: Result<(), TaskError>,
    ) -> Result<(), QueueError> {
        match result {
            Ok(()) => {
                tracing::debug!(task_id = %task.id, task_name = %task.name, "Task completed");
                self.queue.complete(task.id).await
            }
            Err(TaskError::Retryable {
                message,
                retry_after,
            }) if task.policy.can_retry(task.retries) => {
                let delay = task
                    .policy
                    .delay_for(task.retries)
                    .max(retry_after.unwrap_or_default())
                    .min(MAX_RETRY_DELAY);
                tracing::warn!(
                    task_id = %task.id,
                    task_name = %task.name,
                    retries = task.retries,
                    delay_secs = delay.as_secs(),
                    error = %message,
                    "Task failed, retry scheduled"
                );
                self.queue.retry(task.id, delay, &message).await
            }
            Err(TaskError::Retryable { message, .. }) => {
                tracing::error!(
                    task_id = %task.id,
                    task_name = %task.name,
                    attempts = task.retries + 1,
                    error = %message,
                    "Task abandoned after exhausting retries"
                );
                self.queue.fail(task.id, &message).await
            }
            Err(TaskError::Fatal(message)) => {
                tracing::error!(
                    task_id = %task.id,
                    task_name = %task.name,
                    error = %message,
                    "Task failed permanently"
                );
                self.queue.fail(task.id, &message).await
            }
        }
    }
}
