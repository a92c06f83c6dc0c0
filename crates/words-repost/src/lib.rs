//! # words-repost
//!
//! Background repost pipeline for the words blog.
//!
//! A new post is queued as a fan-out task ([`RepostClient::enqueue_repost`]). The
//! [`Dispatcher`] turns it into one delivery task per live subscription of the
//! post owner, routed to a per-service queue. The [`DeliveryWorker`] pushes the
//! post through the service's [`ServiceAdapter`], deactivates subscriptions the
//! service rejects for good and asks for a retry on transient failures.
//!
//! Queues are processed by a [`WorkerPool`]: one [`QueueProcessor`] per named
//! queue, each claiming tasks from a [`TaskQueue`] backend.

pub mod adapters;
pub mod client;
pub mod context;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod routing;
pub mod task;

pub use adapters::{AdapterRegistry, ServiceAdapter, TelegramAdapter, TelegramConfig};
pub use client::RepostClient;
pub use context::{DynTaskQueue, RepostContext};
pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use dispatch::Dispatcher;
pub use error::{DeliveryError, QueueError, RepostError, RepostResult, TaskError};
pub use handler::{RepostHandler, TaskHandler};
pub use pool::{Retention, WorkerPool};
pub use processor::{ExecutionLimits, QueueProcessor};
pub use queue::{
    DEFAULT_MAX_PAYLOAD_BYTES, InMemoryTaskQueue, LEASE_EXPIRED, QueueLimits, TaskQueue,
};
pub use routing::{
    Backoff, MAX_RETRY_DELAY, QueueSettings, RetryPolicy, RoutingConfig, TaskRoute,
};
pub use task::{
    FANOUT_TASK, QueueStats, RepostTask, TaskEnvelope, TaskStatus, delivery_task_name,
};
