//! Delivery of one post to one subscription.

use tracing::{error, info, instrument, warn};
use words_storage::{PostId, SubscriptionId};

use crate::context::RepostContext;
use crate::error::{DeliveryError, TaskError};

/// What a delivery attempt did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The service accepted the message.
    Sent,
    /// The subscription is gone or no longer alive.
    StaleSubscription,
    /// The post was deleted after dispatch.
    MissingPost,
    /// The service rejected the subscription for good. `flipped` is false if a
    /// concurrent attempt already deactivated it.
    Deactivated { flipped: bool },
}

/// Executes delivery tasks against the registered service adapters.
#[derive(Debug, Clone)]
pub struct DeliveryWorker {
    ctx: RepostContext,
}

impl DeliveryWorker {
    pub fn new(ctx: RepostContext) -> Self {
        Self { ctx }
    }

    /// Sends the post to the subscription and applies the failure policy.
    ///
    /// Permanent service errors deactivate the subscription and complete the
    /// task. Transient errors come back as [`TaskError::Retryable`]. Running this
    /// twice for a live subscription only repeats the external send.
    #[instrument(skip(self, post_url), fields(subscription_id = %subscription_id, post_id = %post_id))]
    pub async fn deliver(
        &self,
        subscription_id: SubscriptionId,
        post_id: PostId,
        post_url: &str,
    ) -> Result<DeliveryOutcome, TaskError> {
        let subscription = match self
            .ctx
            .subscriptions
            .get_subscription(subscription_id)
            .await
        {
            Ok(Some(sub)) if sub.alive => sub,
            Ok(_) => {
                info!("Subscription missing or dead, dropping delivery");
                return Ok(DeliveryOutcome::StaleSubscription);
            }
            Err(e) => return Err(retry_for(DeliveryError::from(e))),
        };

        let post = match self.ctx.posts.get_post(post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                info!("Post missing, dropping delivery");
                return Ok(DeliveryOutcome::MissingPost);
            }
            Err(e) => return Err(retry_for(DeliveryError::from(e))),
        };

        let Some(adapter) = self.ctx.adapters.get(subscription.service) else {
            error!(
                service = %subscription.service,
                "No adapter registered for service, abandoning delivery"
            );
            return Err(TaskError::fatal(format!(
                "no adapter registered for {}",
                subscription.service
            )));
        };

        match adapter
            .send(&subscription.credentials, &post.title, post_url)
            .await
        {
            Ok(()) => {
                info!(service = %subscription.service, "Repost delivered");
                Ok(DeliveryOutcome::Sent)
            }
            Err(e) if e.is_permanent() => {
                let flipped = self
                    .ctx
                    .subscriptions
                    .deactivate_subscription(subscription_id)
                    .await
                    .map_err(|store_err| {
                        TaskError::retryable(format!(
                            "{e}; deactivating subscription failed: {store_err}"
                        ))
                    })?;
                warn!(
                    service = %subscription.service,
                    error = %e,
                    flipped,
                    "Service rejected subscription, deactivated"
                );
                Ok(DeliveryOutcome::Deactivated { flipped })
            }
            Err(e @ DeliveryError::PayloadRejected(_)) => {
                error!(error = %e, "Service rejected message content, abandoning delivery");
                Err(TaskError::fatal(e.to_string()))
            }
            Err(e) => {
                warn!(service = %subscription.service, error = %e, "Delivery failed");
                Err(retry_for(e))
            }
        }
    }
}

fn retry_for(err: DeliveryError) -> TaskError {
    TaskError::Retryable {
        retry_after: err.retry_after(),
        message: err.to_string(),
    }
}
