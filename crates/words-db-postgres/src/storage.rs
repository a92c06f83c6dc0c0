//! PostgreSQL implementation of the post and subscription stores.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use words_storage::{
    Credentials, NewPost, NewSubscription, Post, PostId, PostStore, PostUpdate,
    ServiceSubscription, StorageError, SubscriptionId, SubscriptionStore, UserId, markdown,
};

use crate::config::PostgresConfig;
use crate::error::{is_unique_violation, storage_err};
use crate::migrations;
use crate::pool;

const POST_COLUMNS: &str =
    "id, user_id, title, content, tags, content_time, created_at, edited_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, service, credentials, alive";

type PostRow = (
    i64,
    i64,
    String,
    String,
    Vec<String>,
    i32,
    OffsetDateTime,
    OffsetDateTime,
);

type SubscriptionRow = (i64, i64, String, Value, bool);

fn post_from_row(row: PostRow) -> Post {
    let (id, user_id, title, body, tags, reading_time, created_at, edited_at) = row;
    Post {
        id: PostId(id),
        owner_id: UserId(user_id),
        title,
        body,
        tags: tags.into_iter().collect::<BTreeSet<_>>(),
        reading_time: u32::try_from(reading_time).unwrap_or_default(),
        created_at,
        edited_at,
    }
}

fn subscription_from_row(row: SubscriptionRow) -> Result<ServiceSubscription, StorageError> {
    let (id, user_id, service, credentials, alive) = row;
    Ok(ServiceSubscription {
        id: SubscriptionId(id),
        owner_id: UserId(user_id),
        service: service.parse()?,
        credentials: Credentials::try_from(credentials)?,
        alive,
    })
}

fn title_conflict(owner_id: UserId, title: &str) -> StorageError {
    StorageError::already_exists("Post", format!("{owner_id}/{title}"))
}

/// PostgreSQL storage backend for posts and subscriptions.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Creates a pool from the configuration and runs migrations if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or a migration fails.
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let pool = pool::create_pool(&config).await?;

        if config.run_migrations {
            migrations::run(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Creates a storage from an existing pool. Migrations are not run.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PostStore for PostgresStorage {
    #[instrument(skip(self, draft), fields(owner_id = %draft.owner_id))]
    async fn create_post(&self, draft: NewPost) -> Result<Post, StorageError> {
        draft.validate()?;

        let tags: Vec<String> = markdown::extract_tags(&draft.body).into_iter().collect();
        let reading_time = markdown::reading_time_minutes(&draft.body);

        // Tags live in the post row, so the insert is atomic on its own.
        let row: PostRow = sqlx_core::query_as::query_as(&format!(
            "INSERT INTO post (user_id, title, content, tags, content_time) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {POST_COLUMNS}"
        ))
        .bind(draft.owner_id.get())
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&tags)
        .bind(i32::try_from(reading_time).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                title_conflict(draft.owner_id, &draft.title)
            } else {
                storage_err(e)
            }
        })?;

        let post = post_from_row(row);
        debug!(post_id = %post.id, "Created post");
        Ok(post)
    }

    #[instrument(skip(self))]
    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StorageError> {
        let row: Option<PostRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM post WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(post_from_row))
    }

    #[instrument(skip(self, update))]
    async fn update_post(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError> {
        update.validate()?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let current: Option<PostRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM post WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let mut post = current
            .map(post_from_row)
            .ok_or_else(|| StorageError::not_found("Post", id))?;
        post.apply(update, OffsetDateTime::now_utc());

        let tags: Vec<String> = post.tags.iter().cloned().collect();
        sqlx_core::query::query(
            "UPDATE post SET title = $2, content = $3, tags = $4, content_time = $5, \
             edited_at = $6 WHERE id = $1",
        )
        .bind(id.get())
        .bind(&post.title)
        .bind(&post.body)
        .bind(&tags)
        .bind(i32::try_from(post.reading_time).unwrap_or(i32::MAX))
        .bind(post.edited_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                title_conflict(post.owner_id, &post.title)
            } else {
                storage_err(e)
            }
        })?;

        tx.commit().await.map_err(storage_err)?;
        Ok(post)
    }

    #[instrument(skip(self))]
    async fn delete_post(&self, id: PostId) -> Result<bool, StorageError> {
        let result = sqlx_core::query::query("DELETE FROM post WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_posts(&self, owner_id: UserId) -> Result<Vec<Post>, StorageError> {
        let rows: Vec<PostRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM post WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(post_from_row).collect())
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStorage {
    #[instrument(skip(self, subscription), fields(owner_id = %subscription.owner_id, service = %subscription.service))]
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<ServiceSubscription, StorageError> {
        let row: SubscriptionRow = sqlx_core::query_as::query_as(&format!(
            "INSERT INTO service_subscription (user_id, service, credentials) \
             VALUES ($1, $2, $3) RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(subscription.owner_id.get())
        .bind(subscription.service.as_str())
        .bind(subscription.credentials.into_value())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        subscription_from_row(row)
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<ServiceSubscription>, StorageError> {
        let row: Option<SubscriptionRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM service_subscription WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(subscription_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        let rows: Vec<SubscriptionRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM service_subscription \
             WHERE user_id = $1 ORDER BY id"
        ))
        .bind(owner_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(subscription_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_live_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        let rows: Vec<SubscriptionRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM service_subscription \
             WHERE user_id = $1 AND alive ORDER BY id"
        ))
        .bind(owner_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(subscription_from_row).collect()
    }

    #[instrument(skip(self, credentials))]
    async fn update_credentials(
        &self,
        id: SubscriptionId,
        credentials: Credentials,
    ) -> Result<ServiceSubscription, StorageError> {
        let row: Option<SubscriptionRow> = sqlx_core::query_as::query_as(&format!(
            "UPDATE service_subscription SET credentials = $2, alive = TRUE \
             WHERE id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id.get())
        .bind(credentials.into_value())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(subscription_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::not_found("ServiceSubscription", id))
    }

    #[instrument(skip(self))]
    async fn deactivate_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        // The row lock taken by UPDATE serializes racing deactivations.
        let result = sqlx_core::query::query(
            "UPDATE service_subscription SET alive = FALSE WHERE id = $1 AND alive",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        let result = sqlx_core::query::query("DELETE FROM service_subscription WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}
