//! Handles shared by the dispatch and delivery steps.

use std::sync::Arc;

use uuid::Uuid;
use words_storage::{DynPostStore, DynSubscriptionStore};

use crate::adapters::AdapterRegistry;
use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::routing::RoutingConfig;
use crate::task::RepostTask;

/// Shared task queue handle.
pub type DynTaskQueue = Arc<dyn TaskQueue>;

/// Everything a repost step needs, passed explicitly.
#[derive(Clone)]
pub struct RepostContext {
    pub posts: DynPostStore,
    pub subscriptions: DynSubscriptionStore,
    pub queue: DynTaskQueue,
    pub routing: Arc<RoutingConfig>,
    pub adapters: AdapterRegistry,
}

impl RepostContext {
    pub fn new(
        posts: DynPostStore,
        subscriptions: DynSubscriptionStore,
        queue: DynTaskQueue,
        routing: RoutingConfig,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            posts,
            subscriptions,
            queue,
            routing: Arc::new(routing),
            adapters,
        }
    }

    /// Wraps a task according to its route and pushes it.
    pub async fn enqueue(&self, task: &RepostTask) -> Result<Uuid, QueueError> {
        let envelope = self.routing.envelope(task)?;
        self.queue.push(envelope).await
    }
}

impl std::fmt::Debug for RepostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepostContext")
            .field("routing", &self.routing)
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}
