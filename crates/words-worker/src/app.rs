//! Wiring of stores, queue and service adapters from [`AppConfig`].

use std::sync::Arc;

use anyhow::Context;
use words_db_memory::create_storage;
use words_db_postgres::{PostgresStorage, PostgresTaskQueue, pool};
use words_repost::{
    AdapterRegistry, DynTaskQueue, InMemoryTaskQueue, RepostClient, RepostContext,
    RepostHandler, TelegramAdapter, WorkerPool,
};
use words_storage::{DynPostStore, DynSubscriptionStore};

use crate::config::{AppConfig, StorageBackend};

/// Stores and queue of one deployment.
#[derive(Clone)]
pub struct Backends {
    pub posts: DynPostStore,
    pub subscriptions: DynSubscriptionStore,
    pub queue: DynTaskQueue,
}

impl Backends {
    /// Opens the configured backend. PostgreSQL stores and queue share one pool.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        match config.storage.backend {
            StorageBackend::Postgres => {
                let pg = &config.storage.postgres;
                tracing::info!(
                    url = %pool::mask_password(&pg.url),
                    pool_size = pg.pool_size,
                    "Connecting to PostgreSQL"
                );
                let storage = PostgresStorage::new(pg.clone())
                    .await
                    .context("failed to initialize PostgreSQL storage")?;
                pool::test_connection(storage.pool())
                    .await
                    .context("PostgreSQL connection check failed")?;

                let queue = PostgresTaskQueue::new(storage.pool().clone(), config.queue.limits());
                let storage = Arc::new(storage);
                Ok(Self {
                    posts: storage.clone(),
                    subscriptions: storage,
                    queue: Arc::new(queue),
                })
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; queued reposts are lost on restart");
                let storage = create_storage();
                Ok(Self {
                    posts: storage.clone(),
                    subscriptions: storage,
                    queue: Arc::new(InMemoryTaskQueue::new(config.queue.limits())),
                })
            }
        }
    }

    pub fn client(&self, config: &AppConfig) -> RepostClient {
        RepostClient::new(self.queue.clone(), Arc::new(config.routing.clone()))
    }
}

/// Registers an adapter for every service with credentials configured.
pub fn build_adapters(config: &AppConfig) -> anyhow::Result<AdapterRegistry> {
    let mut adapters = AdapterRegistry::new();
    if !config.telegram.bot_token.trim().is_empty() {
        let telegram = TelegramAdapter::new(&config.telegram)
            .context("failed to build Telegram adapter")?;
        adapters = adapters.with_telegram(Arc::new(telegram));
        tracing::info!(proxy = config.telegram.proxy.is_some(), "Telegram adapter enabled");
    }
    Ok(adapters)
}

/// A running worker process: one processor per configured queue.
pub struct Worker {
    pool: WorkerPool,
}

impl Worker {
    /// Connects to the configured backend and starts processing.
    pub async fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let backends = Backends::connect(config).await?;
        let adapters = build_adapters(config)?;
        Ok(Self::with_backends(backends, adapters, config))
    }

    /// Starts processing on already opened backends.
    pub fn with_backends(backends: Backends, adapters: AdapterRegistry, config: &AppConfig) -> Self {
        let ctx = RepostContext::new(
            backends.posts,
            backends.subscriptions,
            backends.queue.clone(),
            config.routing.clone(),
            adapters,
        );
        let handler = Arc::new(RepostHandler::new(ctx));
        let pool = WorkerPool::start(
            backends.queue.clone(),
            handler,
            &config.routing,
            config.queue.execution(),
        )
        .with_cleanup(backends.queue, config.queue.retention());
        tracing::info!(
            queues = ?pool.queues().collect::<Vec<_>>(),
            "Worker started"
        );
        Self { pool }
    }

    pub fn queues(&self) -> Vec<String> {
        self.pool.queues().map(str::to_string).collect()
    }

    /// Stops claiming new tasks and waits for in-flight ones.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
