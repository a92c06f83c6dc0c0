//! Storage traits for the words storage abstraction layer.
//!
//! The repost pipeline only reads posts and only flips the `alive` flag on
//! subscriptions. The remaining operations exist for the web layer and tests.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{
    Credentials, NewPost, NewSubscription, Post, PostId, PostUpdate, ServiceSubscription,
    SubscriptionId, UserId,
};

/// Durable post records.
///
/// Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Creates a post with its tags in one atomic write.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the owner already has a post with this title.
    /// Returns `StorageError::InvalidData` if the draft is malformed.
    async fn create_post(&self, draft: NewPost) -> Result<Post, StorageError>;

    /// Reads a post by ID.
    ///
    /// Returns `None` if the post does not exist. Errors are reserved for infrastructure issues.
    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StorageError>;

    /// Edits a post. Body, tags and edit timestamp change together.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the post does not exist.
    /// Returns `StorageError::AlreadyExists` if the new title collides with another post.
    async fn update_post(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError>;

    /// Deletes a post. Returns `false` if it did not exist.
    async fn delete_post(&self, id: PostId) -> Result<bool, StorageError>;

    /// Lists an owner's posts, newest first.
    async fn list_posts(&self, owner_id: UserId) -> Result<Vec<Post>, StorageError>;
}

/// Durable external-service subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Creates a live subscription.
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<ServiceSubscription, StorageError>;

    /// Reads a subscription by ID, regardless of liveness.
    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<ServiceSubscription>, StorageError>;

    /// Lists every subscription of an owner, ordered by ID.
    async fn list_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError>;

    /// Lists the subscriptions of an owner with `alive == true`, ordered by ID.
    async fn list_live_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError>;

    /// Replaces the credentials of a subscription and marks it alive again.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the subscription does not exist.
    async fn update_credentials(
        &self,
        id: SubscriptionId,
        credentials: Credentials,
    ) -> Result<ServiceSubscription, StorageError>;

    /// Sets `alive = false` as a single-row conditional update.
    ///
    /// Returns `true` if this call flipped the flag, `false` if the subscription was
    /// already dead or no longer exists. Concurrent callers never both observe `true`.
    async fn deactivate_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError>;

    /// Deletes a subscription. Returns `false` if it did not exist.
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError>;
}

/// A backend providing both stores.
pub trait Storage: PostStore + SubscriptionStore {}

impl<T: PostStore + SubscriptionStore> Storage for T {}
