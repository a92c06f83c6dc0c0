use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LEASE_EXPIRED, QueueLimits, TaskQueue};
use crate::error::QueueError;
use crate::task::{QueueStats, TaskEnvelope, TaskStatus, to_time_duration};

/// Single-process task queue.
///
/// All tasks sit behind one mutex so that a claim is atomic across the queue.
/// Completed and failed tasks are kept for inspection until purged.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<HashMap<Uuid, TaskEnvelope>>,
    limits: QueueLimits,
}

impl InMemoryTaskQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            limits,
        }
    }

    /// Every task of a queue in creation order.
    pub async fn tasks_in(&self, queue: &str) -> Vec<TaskEnvelope> {
        let tasks = self.tasks.lock().await;
        let mut found: Vec<TaskEnvelope> =
            tasks.values().filter(|t| t.queue == queue).cloned().collect();
        found.sort_by_key(|t| t.created_at);
        found
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut TaskEnvelope, OffsetDateTime),
    {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let now = OffsetDateTime::now_utc();
        apply(task, now);
        task.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, envelope: TaskEnvelope) -> Result<Uuid, QueueError> {
        self.limits.check(&envelope)?;
        let id = envelope.id;
        self.tasks.lock().await.insert(id, envelope);
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<TaskEnvelope>, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let now = OffsetDateTime::now_utc();

        for task in tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.lease_expired(now))
        {
            recover_expired_lease(task, now);
        }

        let mut due: Vec<&mut TaskEnvelope> = tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.is_claimable(now))
            .collect();
        due.sort_by_key(|t| (t.not_before, t.created_at));

        let lease_until = now.saturating_add(to_time_duration(lease));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|task| {
                task.status = TaskStatus::Running;
                task.lease_until = Some(lease_until);
                task.updated_at = now;
                task.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.update(id, |task, _| {
            task.status = TaskStatus::Completed;
            task.lease_until = None;
        })
        .await
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.update(id, |task, now| {
            task.status = TaskStatus::Pending;
            task.retries += 1;
            task.not_before = now.saturating_add(to_time_duration(delay));
            task.lease_until = None;
            task.last_error = Some(error.to_string());
        })
        .await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.update(id, |task, _| {
            task.status = TaskStatus::Failed;
            task.lease_until = None;
            task.last_error = Some(error.to_string());
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>, QueueError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut stats = QueueStats::default();
        for task in tasks.values().filter(|t| t.queue == queue) {
            stats.record(task.status);
        }
        Ok(stats)
    }

    async fn list_failed(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<TaskEnvelope>, QueueError> {
        let tasks = self.tasks.lock().await;
        let mut failed: Vec<TaskEnvelope> = tasks
            .values()
            .filter(|t| t.queue == queue && t.status == TaskStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn restart_failed(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Failed => {
                let now = OffsetDateTime::now_utc();
                task.status = TaskStatus::Pending;
                task.retries = 0;
                task.not_before = now;
                task.last_error = None;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = OffsetDateTime::now_utc().saturating_sub(to_time_duration(older_than));
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.is_finished() && task.updated_at < cutoff));
        Ok((before - tasks.len()) as u64)
    }
}

/// An expired lease counts as a failed attempt.
fn recover_expired_lease(task: &mut TaskEnvelope, now: OffsetDateTime) {
    if task.policy.can_retry(task.retries) {
        task.status = TaskStatus::Pending;
        task.retries += 1;
    } else {
        task.status = TaskStatus::Failed;
    }
    task.lease_until = None;
    task.last_error = Some(LEASE_EXPIRED.to_string());
    task.updated_at = now;
}
