//! End-to-end tests of the repost pipeline over the in-memory backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use words_db_memory::InMemoryStorage;
use words_repost::{
    AdapterRegistry, DeliveryError, DeliveryOutcome, DeliveryWorker, Dispatcher, ExecutionLimits,
    InMemoryTaskQueue, QueueProcessor, RepostClient, RepostContext, RepostHandler, RepostTask,
    RetryPolicy, RoutingConfig, ServiceAdapter, TaskError, TaskQueue, TaskStatus,
    TelegramAdapter, TelegramConfig,
};
use words_storage::{
    Credentials, NewPost, NewSubscription, Post, PostId, PostStore, PostUpdate, ServiceKind,
    ServiceSubscription, StorageError, SubscriptionId, SubscriptionStore, UserId,
};

const ALICE: UserId = UserId(1);
const HELLO_URL: &str = "https://words.example/alice/hello";

/// Adapter double that records every send and answers with a fixed result.
struct Recording {
    sent: Mutex<Vec<(String, String, String)>>,
    result: fn() -> Result<(), DeliveryError>,
}

impl Recording {
    fn new(result: fn() -> Result<(), DeliveryError>) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            result,
        })
    }

    fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ServiceAdapter for Recording {
    async fn send(
        &self,
        credentials: &Credentials,
        title: &str,
        url: &str,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((
            credentials.get_str("channel_name").unwrap_or_default().to_string(),
            title.to_string(),
            url.to_string(),
        ));
        (self.result)()
    }
}

struct Harness {
    storage: Arc<InMemoryStorage>,
    queue: Arc<InMemoryTaskQueue>,
    ctx: RepostContext,
}

impl Harness {
    fn new(adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self::with_routing(adapter, instant_retries())
    }

    fn with_routing(adapter: Arc<dyn ServiceAdapter>, routing: RoutingConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = Arc::new(InMemoryTaskQueue::default());
        let ctx = RepostContext::new(
            storage.clone(),
            storage.clone(),
            queue.clone(),
            routing,
            AdapterRegistry::new().with_telegram(adapter),
        );
        Self {
            storage,
            queue,
            ctx,
        }
    }

    fn client(&self) -> RepostClient {
        RepostClient::new(self.queue.clone(), self.ctx.routing.clone())
    }

    async fn publish(&self, title: &str) -> Post {
        self.storage
            .create_post(NewPost::new(ALICE, title, "first post #hello"))
            .await
            .unwrap()
    }

    async fn subscribe(&self, service: ServiceKind, channel: &str) -> ServiceSubscription {
        self.storage
            .create_subscription(NewSubscription::new(
                ALICE,
                service,
                Credentials::new().with("channel_name", channel),
            ))
            .await
            .unwrap()
    }

    /// Runs every queue until nothing is due.
    async fn run_until_idle(&self) {
        let handler = Arc::new(RepostHandler::new(self.ctx.clone()));
        let processors: Vec<QueueProcessor> = self
            .ctx
            .routing
            .queues
            .iter()
            .map(|settings| {
                QueueProcessor::new(
                    self.queue.clone(),
                    handler.clone(),
                    settings.clone(),
                    ExecutionLimits::default(),
                )
            })
            .collect();

        loop {
            let mut claimed = 0;
            for processor in &processors {
                claimed += processor.process_batch().await.unwrap();
            }
            if claimed == 0 {
                break;
            }
        }
    }

    async fn alive(&self, sub: &ServiceSubscription) -> bool {
        self.storage
            .get_subscription(sub.id)
            .await
            .unwrap()
            .unwrap()
            .alive
    }
}

fn instant_retries() -> RoutingConfig {
    RoutingConfig::default().with_retry_policy(RetryPolicy {
        base_delay_secs: 0,
        ..RetryPolicy::delivery()
    })
}

fn ok() -> Result<(), DeliveryError> {
    Ok(())
}

fn chat_not_found() -> Result<(), DeliveryError> {
    Err(DeliveryError::ServiceNotFound("chat not found".into()))
}

fn unavailable() -> Result<(), DeliveryError> {
    Err(DeliveryError::ServiceUnavailable("502 Bad Gateway".into()))
}

#[tokio::test]
async fn dispatch_enqueues_one_task_per_live_subscription() {
    let harness = Harness::new(Recording::new(ok));
    let post = harness.publish("Hello").await;
    let demo = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let other = harness.subscribe(ServiceKind::Telegram, "@other").await;
    let dead = harness.subscribe(ServiceKind::Telegram, "@dead").await;
    harness
        .storage
        .deactivate_subscription(dead.id)
        .await
        .unwrap();

    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(post.id, HELLO_URL)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let tasks = harness.queue.tasks_in("telegram").await;
    let mut targets: Vec<_> = tasks
        .iter()
        .map(|t| match t.task().unwrap() {
            RepostTask::Deliver {
                subscription_id, ..
            } => subscription_id,
            other => panic!("unexpected task {other:?}"),
        })
        .collect();
    targets.sort();
    assert_eq!(targets, vec![demo.id, other.id]);
}

#[tokio::test]
async fn dispatch_skips_services_without_adapter() {
    let harness = Harness::new(Recording::new(ok));
    let post = harness.publish("Hello").await;
    harness.subscribe(ServiceKind::Twitter, "@alice").await;
    harness.subscribe(ServiceKind::Telegram, "@demo").await;

    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(post.id, HELLO_URL)
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert!(harness.queue.tasks_in("twitter").await.is_empty());
}

#[tokio::test]
async fn dispatch_skips_unrouted_service() {
    let mut routing = instant_retries();
    routing
        .tasks
        .retain(|route| route.task != "words.tasks.repost.telegram");
    let harness = Harness::with_routing(Recording::new(ok), routing);
    let post = harness.publish("Hello").await;
    harness.subscribe(ServiceKind::Telegram, "@demo").await;

    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(post.id, HELLO_URL)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn dispatch_of_missing_post_is_noop() {
    let harness = Harness::new(Recording::new(ok));
    harness.subscribe(ServiceKind::Telegram, "@demo").await;

    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(PostId(404), HELLO_URL)
        .await
        .unwrap();

    assert_eq!(count, 0);
    assert!(harness.queue.tasks_in("telegram").await.is_empty());
}

#[tokio::test]
async fn delivery_for_missing_entities_is_noop() {
    let adapter = Recording::new(ok);
    let harness = Harness::new(adapter.clone());
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;
    let worker = DeliveryWorker::new(harness.ctx.clone());

    let outcome = worker.deliver(sub.id, PostId(404), HELLO_URL).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::MissingPost);

    harness.storage.delete_subscription(sub.id).await.unwrap();
    let outcome = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::StaleSubscription);

    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn repeated_delivery_is_idempotent() {
    let adapter = Recording::new(ok);
    let harness = Harness::new(adapter.clone());
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;
    let worker = DeliveryWorker::new(harness.ctx.clone());

    for _ in 0..2 {
        let outcome = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);
    }

    assert_eq!(adapter.calls(), 2);
    assert!(harness.alive(&sub).await);
}

#[tokio::test]
async fn permanent_failure_deactivates_once() {
    let adapter = Recording::new(chat_not_found);
    let harness = Harness::new(adapter.clone());
    let sub = harness.subscribe(ServiceKind::Telegram, "@gone").await;
    let post = harness.publish("Hello").await;
    let worker = DeliveryWorker::new(harness.ctx.clone());

    let first = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap();
    assert_eq!(first, DeliveryOutcome::Deactivated { flipped: true });
    assert!(!harness.alive(&sub).await);

    // A duplicate of the same task finds the subscription dead and does nothing.
    let second = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap();
    assert_eq!(second, DeliveryOutcome::StaleSubscription);
    assert_eq!(adapter.calls(), 1);

    // Later posts skip the dead subscription entirely.
    let next = harness.publish("Second").await;
    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(next.id, "https://words.example/alice/second")
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(!harness.alive(&sub).await);
}

#[tokio::test]
async fn payload_rejection_is_fatal_without_deactivation() {
    let harness = Harness::new(Recording::new(|| {
        Err(DeliveryError::PayloadRejected("can't parse entities".into()))
    }));
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello_world").await;

    let err = DeliveryWorker::new(harness.ctx.clone())
        .deliver(sub.id, post.id, HELLO_URL)
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Fatal(_)));
    assert!(harness.alive(&sub).await);
}

#[tokio::test]
async fn transient_failure_is_attempted_max_retries_plus_one_times() {
    let adapter = Recording::new(unavailable);
    let harness = Harness::new(adapter.clone());
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;

    harness
        .client()
        .enqueue_repost(post.id, HELLO_URL)
        .await
        .unwrap();
    harness.run_until_idle().await;

    assert_eq!(adapter.calls(), 4);
    assert!(harness.alive(&sub).await);

    let tasks = harness.queue.tasks_in("telegram").await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].retries, 3);

    let failed = harness.queue.list_failed("telegram", 10).await.unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn rate_limit_hint_extends_delay() {
    let harness = Harness::new(Recording::new(|| {
        Err(DeliveryError::ServiceRateLimited {
            message: "Too Many Requests".into(),
            retry_after: Some(std::time::Duration::from_secs(30)),
        })
    }));
    harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;

    harness
        .client()
        .enqueue_repost(post.id, HELLO_URL)
        .await
        .unwrap();
    harness.run_until_idle().await;

    // One attempt, then parked for the requested 30 seconds.
    let task = &harness.queue.tasks_in("telegram").await[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 1);
    assert!(task.not_before > time::OffsetDateTime::now_utc() + time::Duration::seconds(20));
}

/// Post store whose reads always fail.
struct BrokenPosts;

#[async_trait]
impl PostStore for BrokenPosts {
    async fn create_post(&self, _: NewPost) -> Result<Post, StorageError> {
        Err(StorageError::connection_error("connection refused"))
    }

    async fn get_post(&self, _: PostId) -> Result<Option<Post>, StorageError> {
        Err(StorageError::connection_error("connection refused"))
    }

    async fn update_post(&self, _: PostId, _: PostUpdate) -> Result<Post, StorageError> {
        Err(StorageError::connection_error("connection refused"))
    }

    async fn delete_post(&self, _: PostId) -> Result<bool, StorageError> {
        Err(StorageError::connection_error("connection refused"))
    }

    async fn list_posts(&self, _: UserId) -> Result<Vec<Post>, StorageError> {
        Err(StorageError::connection_error("connection refused"))
    }
}

#[tokio::test]
async fn storage_failure_retries_dispatch_then_abandons() {
    let storage = Arc::new(InMemoryStorage::new());
    let queue = Arc::new(InMemoryTaskQueue::default());
    let routing = instant_retries();
    let ctx = RepostContext::new(
        Arc::new(BrokenPosts),
        storage.clone(),
        queue.clone(),
        routing.clone(),
        AdapterRegistry::new().with_telegram(Recording::new(ok)),
    );

    let err = Dispatcher::new(ctx.clone())
        .dispatch(PostId(1), HELLO_URL)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let id = RepostClient::new(queue.clone(), ctx.routing.clone())
        .enqueue_repost(PostId(1), HELLO_URL)
        .await
        .unwrap();
    let processor = QueueProcessor::new(
        queue.clone(),
        Arc::new(RepostHandler::new(ctx)),
        routing.queue("repost").unwrap().clone(),
        ExecutionLimits::default(),
    );

    let mut attempts = 0;
    while processor.process_batch().await.unwrap() > 0 {
        attempts += 1;
    }
    assert_eq!(attempts, 4);

    let task = queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains("connection refused"));
}

/// Subscription store over the in-memory one whose reads or deactivations fail.
struct FlakySubscriptions {
    inner: Arc<InMemoryStorage>,
    fail_reads: bool,
    fail_deactivate: bool,
}

fn fail_if(fail: bool) -> Result<(), StorageError> {
    if fail {
        return Err(StorageError::connection_error("connection reset"));
    }
    Ok(())
}

#[async_trait]
impl SubscriptionStore for FlakySubscriptions {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<ServiceSubscription, StorageError> {
        self.inner.create_subscription(subscription).await
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<ServiceSubscription>, StorageError> {
        fail_if(self.fail_reads)?;
        self.inner.get_subscription(id).await
    }

    async fn list_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        fail_if(self.fail_reads)?;
        self.inner.list_subscriptions(owner_id).await
    }

    async fn list_live_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        fail_if(self.fail_reads)?;
        self.inner.list_live_subscriptions(owner_id).await
    }

    async fn update_credentials(
        &self,
        id: SubscriptionId,
        credentials: Credentials,
    ) -> Result<ServiceSubscription, StorageError> {
        self.inner.update_credentials(id, credentials).await
    }

    async fn deactivate_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        fail_if(self.fail_deactivate)?;
        self.inner.deactivate_subscription(id).await
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        self.inner.delete_subscription(id).await
    }
}

fn flaky_worker(
    storage: &Arc<InMemoryStorage>,
    adapter: Arc<dyn ServiceAdapter>,
    fail_reads: bool,
    fail_deactivate: bool,
) -> DeliveryWorker {
    let subscriptions = Arc::new(FlakySubscriptions {
        inner: storage.clone(),
        fail_reads,
        fail_deactivate,
    });
    DeliveryWorker::new(RepostContext::new(
        storage.clone(),
        subscriptions,
        Arc::new(InMemoryTaskQueue::default()),
        instant_retries(),
        AdapterRegistry::new().with_telegram(adapter),
    ))
}

#[tokio::test]
async fn failed_deactivation_is_retried_and_keeps_subscription_alive() {
    let adapter = Recording::new(chat_not_found);
    let harness = Harness::new(adapter.clone());
    let post = harness.publish("Hello").await;
    let sub = harness.subscribe(ServiceKind::Telegram, "@gone").await;

    let worker = flaky_worker(&harness.storage, adapter.clone(), false, true);
    let err = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap_err();

    match err {
        TaskError::Retryable { message, .. } => {
            assert!(message.contains("chat not found"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected a retryable error, got {other:?}"),
    }
    assert_eq!(adapter.calls(), 1);
    assert!(harness.alive(&sub).await);
}

#[tokio::test]
async fn subscription_load_failure_is_retried_without_sending() {
    let adapter = Recording::new(ok);
    let harness = Harness::new(adapter.clone());
    let post = harness.publish("Hello").await;
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;

    let worker = flaky_worker(&harness.storage, adapter.clone(), true, false);
    let err = worker.deliver(sub.id, post.id, HELLO_URL).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Retryable { ref message, .. } if message.contains("connection reset")
    ));
    assert_eq!(adapter.calls(), 0);
    assert!(harness.alive(&sub).await);
}

#[tokio::test]
async fn post_load_failure_during_delivery_is_retried() {
    let adapter = Recording::new(ok);
    let harness = Harness::new(adapter.clone());
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let worker = DeliveryWorker::new(RepostContext::new(
        Arc::new(BrokenPosts),
        harness.storage.clone(),
        harness.queue.clone(),
        instant_retries(),
        AdapterRegistry::new().with_telegram(adapter.clone()),
    ));

    let err = worker.deliver(sub.id, PostId(1), HELLO_URL).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Retryable { ref message, .. } if message.contains("connection refused")
    ));
    assert_eq!(adapter.calls(), 0);
    assert!(harness.alive(&sub).await);
}

#[tokio::test]
async fn fanout_and_delivery_run_on_separate_queues() {
    let adapter = Recording::new(ok);
    let harness = Harness::new(adapter.clone());
    harness.subscribe(ServiceKind::Telegram, "@demo").await;
    harness.subscribe(ServiceKind::Telegram, "@backup").await;
    let post = harness.publish("Hello").await;

    let fanout = harness
        .client()
        .enqueue_repost(post.id, HELLO_URL)
        .await
        .unwrap();
    harness.run_until_idle().await;

    let fanout = harness.queue.get(fanout).await.unwrap().unwrap();
    assert_eq!(fanout.queue, "repost");
    assert_eq!(fanout.status, TaskStatus::Completed);

    let stats = harness.queue.stats("telegram").await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);

    let mut channels: Vec<String> = adapter
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|(channel, _, _)| channel.clone())
        .collect();
    channels.sort();
    assert_eq!(channels, vec!["@backup", "@demo"]);
}

async fn telegram_harness(server: &MockServer) -> Harness {
    let config = TelegramConfig::new("123:abc").with_api_base(server.uri());
    Harness::new(Arc::new(TelegramAdapter::new(&config).unwrap()))
}

#[tokio::test]
async fn alice_posts_hello_to_demo_channel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot123:abc/sendMessage"))
        .and(body_json(json!({
            "chat_id": "@demo",
            "text": format!("*Hello*\n\n{HELLO_URL}"),
            "parse_mode": "Markdown",
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {"message_id": 1}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = telegram_harness(&server).await;
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;

    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(post.id, HELLO_URL)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let tasks = harness.queue.tasks_in("telegram").await;
    assert_eq!(
        tasks[0].task().unwrap(),
        RepostTask::Deliver {
            subscription_id: sub.id,
            post_id: post.id,
            post_url: HELLO_URL.to_string(),
            service: ServiceKind::Telegram,
        }
    );

    harness.run_until_idle().await;

    assert!(harness.alive(&sub).await);
    let task = harness.queue.get(tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries, 0);
}

#[tokio::test]
async fn alice_channel_not_found_deactivates_subscription() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot123:abc/sendMessage"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let harness = telegram_harness(&server).await;
    let sub = harness.subscribe(ServiceKind::Telegram, "@demo").await;
    let post = harness.publish("Hello").await;

    harness
        .client()
        .enqueue_repost(post.id, HELLO_URL)
        .await
        .unwrap();
    harness.run_until_idle().await;

    assert!(!harness.alive(&sub).await);
    let tasks = harness.queue.tasks_in("telegram").await;
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].retries, 0);
}

#[tokio::test]
async fn editing_credentials_reactivates_for_next_post() {
    let harness = Harness::new(Recording::new(ok));
    let sub = harness.subscribe(ServiceKind::Telegram, "@old").await;
    harness
        .storage
        .deactivate_subscription(sub.id)
        .await
        .unwrap();

    harness
        .storage
        .update_credentials(sub.id, Credentials::new().with("channel_name", "@new"))
        .await
        .unwrap();

    let post = harness.publish("Hello").await;
    let count = Dispatcher::new(harness.ctx.clone())
        .dispatch(post.id, HELLO_URL)
        .await
        .unwrap();
    assert_eq!(count, 1);
}
