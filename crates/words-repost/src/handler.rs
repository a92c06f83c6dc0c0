//! Task execution entry point.

use async_trait::async_trait;

use crate::context::RepostContext;
use crate::delivery::DeliveryWorker;
use crate::dispatch::Dispatcher;
use crate::error::TaskError;
use crate::task::{RepostTask, TaskEnvelope};

/// Executes one claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskError>;
}

/// Routes repost payloads to the dispatcher or the delivery worker.
#[derive(Debug, Clone)]
pub struct RepostHandler {
    dispatcher: Dispatcher,
    worker: DeliveryWorker,
}

impl RepostHandler {
    pub fn new(ctx: RepostContext) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx.clone()),
            worker: DeliveryWorker::new(ctx),
        }
    }
}

#[async_trait]
impl TaskHandler for RepostHandler {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskError> {
        let task = envelope
            .task()
            .map_err(|e| TaskError::fatal(format!("undecodable {} payload: {e}", envelope.name)))?;

        match task {
            RepostTask::Fanout { post_id, post_url } => {
                self.dispatcher.dispatch(post_id, &post_url).await?;
            }
            RepostTask::Deliver {
                subscription_id,
                post_id,
                post_url,
                ..
            } => {
                self.worker
                    .deliver(subscription_id, post_id, &post_url)
                    .await?;
            }
        }
        Ok(())
    }
}
