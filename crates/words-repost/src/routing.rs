//! Task routing and retry policies.
//!
//! Routing is configuration, not logic: a task name maps to a queue and a retry
//! policy, and every queue carries its own concurrency and polling settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use words_storage::ServiceKind;

use crate::error::QueueError;
use crate::task::{FANOUT_TASK, RepostTask, TaskEnvelope, delivery_task_name};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts (2 minutes).
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 120;

/// Upper bound on any retry delay, including one a service asks for.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How the retry delay grows with the number of retries so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * (1 + retries_so_far)`.
    Linear,
}

/// Per-task retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_backoff() -> Backoff {
    Backoff::Linear
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::delivery()
    }
}

impl RetryPolicy {
    /// Fan-out retries: 3 attempts after the first, fixed 2 minute delay.
    pub fn dispatch() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            backoff: Backoff::Fixed,
        }
    }

    /// Delivery retries: 3 attempts after the first, 2, 4 and 6 minutes apart.
    pub fn delivery() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            backoff: Backoff::Linear,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// Delay before the next attempt, given how many retries already happened.
    ///
    /// Never exceeds [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retries_so_far: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay(),
            Backoff::Linear => self.base_delay().saturating_mul(retries_so_far.saturating_add(1)),
        };
        delay.min(MAX_RETRY_DELAY)
    }

    /// Default policy for a task name: fixed for the fan-out, linear for deliveries.
    pub fn for_task(task: &str) -> Self {
        if task == FANOUT_TASK {
            Self::dispatch()
        } else {
            Self::delivery()
        }
    }

    /// Whether another attempt is allowed after `retries_so_far` retries.
    pub fn can_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Where a task name goes and how it is retried.
///
/// A route without `retry` gets [`RetryPolicy::for_task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawTaskRoute")]
pub struct TaskRoute {
    pub task: String,
    pub queue: String,
    pub retry: RetryPolicy,
}

#[derive(Deserialize)]
struct RawTaskRoute {
    task: String,
    queue: String,
    retry: Option<RetryPolicy>,
}

impl From<RawTaskRoute> for TaskRoute {
    fn from(raw: RawTaskRoute) -> Self {
        let retry = raw.retry.unwrap_or_else(|| RetryPolicy::for_task(&raw.task));
        Self {
            task: raw.task,
            queue: raw.queue,
            retry,
        }
    }
}

/// Worker settings for one named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    /// Maximum tasks of this queue running at once in one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl QueueSettings {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Task name to queue mapping plus per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub tasks: Vec<TaskRoute>,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
}

impl Default for RoutingConfig {
    /// Fan-out on `repost`, one queue per service kind. Telegram runs serialized.
    fn default() -> Self {
        let mut tasks = vec![TaskRoute {
            task: FANOUT_TASK.to_string(),
            queue: "repost".to_string(),
            retry: RetryPolicy::dispatch(),
        }];
        let mut queues = vec![QueueSettings::new("repost", 4)];

        for kind in ServiceKind::ALL {
            let concurrency = match kind {
                ServiceKind::Telegram => 1,
                ServiceKind::Twitter => 4,
            };
            tasks.push(TaskRoute {
                task: delivery_task_name(kind).to_string(),
                queue: kind.slug().to_string(),
                retry: RetryPolicy::delivery(),
            });
            queues.push(QueueSettings::new(kind.slug(), concurrency));
        }

        Self { tasks, queues }
    }
}

impl RoutingConfig {
    /// Looks up the route of a task name.
    pub fn route(&self, task: &str) -> Option<&TaskRoute> {
        self.tasks.iter().find(|route| route.task == task)
    }

    /// Looks up the settings of a queue.
    pub fn queue(&self, name: &str) -> Option<&QueueSettings> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    /// Wraps a task for the queue and retry policy of its route.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Unrouted` if no route is configured for the task name.
    pub fn envelope(&self, task: &RepostTask) -> Result<TaskEnvelope, QueueError> {
        let route = self
            .route(task.name())
            .ok_or_else(|| QueueError::Unrouted(task.name().to_string()))?;
        TaskEnvelope::new(task, &route.queue, route.retry)
    }

    /// Replaces the retry policy of every route.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        for route in &mut self.tasks {
            route.retry = policy;
        }
        self
    }

    /// Checks that every route targets a configured queue and every queue can run.
    pub fn validate(&self) -> Result<(), String> {
        for (i, queue) in self.queues.iter().enumerate() {
            if queue.name.trim().is_empty() {
                return Err("routing.queues: queue name must not be empty".into());
            }
            if queue.concurrency == 0 {
                return Err(format!(
                    "routing.queues.{}: concurrency must be greater than 0",
                    queue.name
                ));
            }
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(format!("routing.queues: duplicate queue {}", queue.name));
            }
        }

        for (i, route) in self.tasks.iter().enumerate() {
            if self.queue(&route.queue).is_none() {
                return Err(format!(
                    "routing.tasks.{}: queue {} is not configured",
                    route.task, route.queue
                ));
            }
            if self.tasks[..i].iter().any(|r| r.task == route.task) {
                return Err(format!("routing.tasks: duplicate route {}", route.task));
            }
            if route.retry.base_delay() > MAX_RETRY_DELAY {
                return Err(format!(
                    "routing.tasks.{}: retry.base_delay_secs must not exceed {}",
                    route.task,
                    MAX_RETRY_DELAY.as_secs()
                ));
            }
        }

        if self.route(FANOUT_TASK).is_none() {
            return Err(format!("routing.tasks: {FANOUT_TASK} must be routed"));
        }

        Ok(())
    }
}
