//! Fan-out of a new post to the owner's live subscriptions.

use tracing::{debug, error, info, instrument};
use words_storage::PostId;

use crate::context::RepostContext;
use crate::error::{QueueError, TaskError};
use crate::task::RepostTask;

/// Turns one published post into one delivery task per live subscription.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: RepostContext,
}

impl Dispatcher {
    pub fn new(ctx: RepostContext) -> Self {
        Self { ctx }
    }

    /// Enqueues delivery tasks for `post_id` and returns how many were enqueued.
    ///
    /// A missing post is not an error: it may have been deleted after the
    /// fan-out was queued. Storage and queue failures are retryable and retry
    /// the whole fan-out.
    #[instrument(skip(self, post_url), fields(post_id = %post_id))]
    pub async fn dispatch(&self, post_id: PostId, post_url: &str) -> Result<usize, TaskError> {
        let Some(post) = self.ctx.posts.get_post(post_id).await? else {
            info!("Post no longer exists, nothing to repost");
            return Ok(0);
        };

        let subscriptions = self
            .ctx
            .subscriptions
            .list_live_subscriptions(post.owner_id)
            .await?;

        let mut enqueued = 0;
        for subscription in subscriptions {
            if !self.ctx.adapters.supports(subscription.service) {
                error!(
                    subscription_id = %subscription.id,
                    service = %subscription.service,
                    "No adapter registered for service, skipping subscription"
                );
                continue;
            }

            let task = RepostTask::Deliver {
                subscription_id: subscription.id,
                post_id,
                post_url: post_url.to_string(),
                service: subscription.service,
            };

            match self.ctx.enqueue(&task).await {
                Ok(task_id) => {
                    debug!(
                        %task_id,
                        subscription_id = %subscription.id,
                        task_name = task.name(),
                        "Enqueued delivery"
                    );
                    enqueued += 1;
                }
                Err(QueueError::Unrouted(name)) => {
                    error!(
                        subscription_id = %subscription.id,
                        service = %subscription.service,
                        task_name = %name,
                        "No queue route for delivery task, skipping subscription"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(enqueued, "Dispatched post");
        Ok(enqueued)
    }
}
