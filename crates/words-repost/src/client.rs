use std::sync::Arc;

use uuid::Uuid;
use words_storage::PostId;

use crate::context::DynTaskQueue;
use crate::error::RepostError;
use crate::routing::RoutingConfig;
use crate::task::RepostTask;

/// Entry point for the web layer: queues the fan-out of a new post.
#[derive(Clone)]
pub struct RepostClient {
    queue: DynTaskQueue,
    routing: Arc<RoutingConfig>,
}

impl RepostClient {
    pub fn new(queue: DynTaskQueue, routing: Arc<RoutingConfig>) -> Self {
        Self { queue, routing }
    }

    /// Queues the repost of a committed post. Returns the fan-out task ID.
    ///
    /// Delivery happens in the background; its outcome never reaches the caller.
    pub async fn enqueue_repost(
        &self,
        post_id: PostId,
        post_url: impl Into<String>,
    ) -> Result<Uuid, RepostError> {
        let task = RepostTask::Fanout {
            post_id,
            post_url: post_url.into(),
        };
        let envelope = self.routing.envelope(&task)?;
        let id = self.queue.push(envelope).await?;
        tracing::debug!(task_id = %id, post_id = %post_id, "Repost queued");
        Ok(id)
    }
}
