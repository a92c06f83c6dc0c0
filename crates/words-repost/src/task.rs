//! Task payloads and the queue envelope that carries them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use words_storage::{PostId, ServiceKind, SubscriptionId};

use crate::error::QueueError;
use crate::routing::RetryPolicy;

/// Task name of the fan-out step.
pub const FANOUT_TASK: &str = "words.tasks.repost.all";

/// Task name of the delivery step for a service kind.
pub fn delivery_task_name(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::Telegram => "words.tasks.repost.telegram",
        ServiceKind::Twitter => "words.tasks.repost.twitter",
    }
}

/// A unit of repost work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RepostTask {
    /// Enqueue one delivery per live subscription of the post owner.
    Fanout { post_id: PostId, post_url: String },
    /// Push one post to one subscription.
    Deliver {
        subscription_id: SubscriptionId,
        post_id: PostId,
        post_url: String,
        service: ServiceKind,
    },
}

impl RepostTask {
    /// Name used for routing.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fanout { .. } => FANOUT_TASK,
            Self::Deliver { service, .. } => delivery_task_name(*service),
        }
    }

    pub fn post_id(&self) -> PostId {
        match self {
            Self::Fanout { post_id, .. } | Self::Deliver { post_id, .. } => *post_id,
        }
    }
}

/// Lifecycle of an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::Backend(format!("unknown task status: {other}"))),
        }
    }
}

/// A task as stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub name: String,
    pub queue: String,
    pub payload: serde_json::Value,

    /// Retries performed so far. The first attempt runs with `retries == 0`.
    pub retries: u32,
    pub policy: RetryPolicy,
    pub status: TaskStatus,

    /// Earliest time the task may be claimed.
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,

    /// Set while running; an expired lease makes the task claimable again.
    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_until: Option<OffsetDateTime>,

    pub last_error: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TaskEnvelope {
    /// Wraps a task for the given queue, due immediately.
    pub fn new(
        task: &RepostTask,
        queue: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            id: Uuid::new_v4(),
            name: task.name().to_string(),
            queue: queue.into(),
            payload: serde_json::to_value(task)?,
            retries: 0,
            policy,
            status: TaskStatus::Pending,
            not_before: now,
            lease_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decodes the payload.
    pub fn task(&self) -> Result<RepostTask, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Serialized payload size in bytes.
    pub fn payload_size(&self) -> Result<usize, QueueError> {
        Ok(serde_json::to_vec(&self.payload)?.len())
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_claimable(&self, now: OffsetDateTime) -> bool {
        (self.status == TaskStatus::Pending && self.not_before <= now) || self.lease_expired(now)
    }

    /// Whether the task is running on a lease that ran out before `now`.
    pub fn lease_expired(&self, now: OffsetDateTime) -> bool {
        self.status == TaskStatus::Running && self.lease_until.is_some_and(|lease| lease <= now)
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Task counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Converts a std duration into a `time` duration, saturating.
pub(crate) fn to_time_duration(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}
