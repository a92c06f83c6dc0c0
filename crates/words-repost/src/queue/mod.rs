//! Task queue contract.
//!
//! Backends provide at-least-once execution: a claimed task is leased to one
//! worker, and a lease that runs out makes the task claimable again. Running
//! out of a lease uses up one retry.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::{QueueStats, TaskEnvelope};

pub use memory::InMemoryTaskQueue;

/// `last_error` of a task whose lease ran out.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Default cap on a serialized task payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// Resource limits enforced by queue backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl QueueLimits {
    /// Rejects envelopes whose payload exceeds the cap.
    pub fn check(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let size = envelope.payload_size()?;
        if size > self.max_payload_bytes {
            return Err(QueueError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Durable task queue with delayed retries and a failed (dead-letter) state.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Persists a pending task and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::PayloadTooLarge` if the payload exceeds the configured cap.
    async fn push(&self, envelope: TaskEnvelope) -> Result<Uuid, QueueError>;

    /// Atomically moves up to `limit` due tasks of `queue` to `running` and returns them.
    ///
    /// Due tasks are pending tasks whose `not_before` has passed and running tasks
    /// whose lease expired. Oldest first. An expired lease counts as a retry, and
    /// a task without retries left is failed instead of claimed.
    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<TaskEnvelope>, QueueError>;

    /// Marks a task completed.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Returns a task to pending with its retry counter incremented, due after `delay`.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Moves a task to the failed state.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Task counts by status for one queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Most recently failed tasks of a queue.
    async fn list_failed(&self, queue: &str, limit: usize)
    -> Result<Vec<TaskEnvelope>, QueueError>;

    /// Puts a failed task back to pending with a fresh retry budget.
    ///
    /// Returns `false` if the task does not exist or is not failed.
    async fn restart_failed(&self, id: Uuid) -> Result<bool, QueueError>;

    /// Deletes completed and failed tasks last updated more than `older_than` ago.
    ///
    /// Returns the number of tasks deleted.
    async fn purge_finished(&self, older_than: Duration) -> Result<u64, QueueError>;
}
