use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use words_storage::{
    Credentials, NewPost, NewSubscription, Post, PostId, PostStore, PostUpdate,
    ServiceSubscription, StorageError, SubscriptionId, SubscriptionStore, UserId,
};

/// Posts plus the (owner, title) uniqueness index, guarded together so that
/// a post and its index entry are always written atomically.
#[derive(Debug, Default)]
struct PostTable {
    rows: HashMap<PostId, Post>,
    titles: HashMap<(UserId, String), PostId>,
}

/// In-memory storage backend.
///
/// This storage implementation provides:
/// - Posts behind a single `RwLock`, so tags and body never appear half-written
/// - Subscriptions in a `DashMap`, giving row-level locking for the
///   conditional `alive` flip
/// - Monotonic ID generation starting at 1
#[derive(Debug)]
pub struct InMemoryStorage {
    posts: Arc<RwLock<PostTable>>,
    subscriptions: Arc<DashMap<SubscriptionId, ServiceSubscription>>,
    post_counter: AtomicI64,
    subscription_counter: AtomicI64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Creates a new, empty in-memory storage.
    pub fn new() -> Self {
        Self {
            posts: Arc::new(RwLock::new(PostTable::default())),
            subscriptions: Arc::new(DashMap::new()),
            post_counter: AtomicI64::new(1),
            subscription_counter: AtomicI64::new(1),
        }
    }

    fn next_post_id(&self) -> PostId {
        PostId(self.post_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.subscription_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of stored posts.
    pub async fn post_count(&self) -> usize {
        self.posts.read().await.rows.len()
    }

    /// Number of stored subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

fn title_conflict(owner_id: UserId, title: &str) -> StorageError {
    StorageError::already_exists("Post", format!("{owner_id}/{title}"))
}

#[async_trait]
impl PostStore for InMemoryStorage {
    async fn create_post(&self, draft: NewPost) -> Result<Post, StorageError> {
        draft.validate()?;

        let mut table = self.posts.write().await;
        let key = (draft.owner_id, draft.title.clone());
        if table.titles.contains_key(&key) {
            return Err(title_conflict(draft.owner_id, &draft.title));
        }

        let post = Post::from_draft(self.next_post_id(), draft, OffsetDateTime::now_utc());
        table.titles.insert(key, post.id);
        table.rows.insert(post.id, post.clone());
        Ok(post)
    }

    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StorageError> {
        Ok(self.posts.read().await.rows.get(&id).cloned())
    }

    async fn update_post(&self, id: PostId, update: PostUpdate) -> Result<Post, StorageError> {
        update.validate()?;

        let mut table = self.posts.write().await;
        let current = table
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("Post", id))?;

        if let Some(ref title) = update.title
            && *title != current.title
        {
            let new_key = (current.owner_id, title.clone());
            if table.titles.contains_key(&new_key) {
                return Err(title_conflict(current.owner_id, title));
            }
            table.titles.remove(&(current.owner_id, current.title.clone()));
            table.titles.insert(new_key, id);
        }

        let mut post = current;
        post.apply(update, OffsetDateTime::now_utc());
        table.rows.insert(id, post.clone());
        Ok(post)
    }

    async fn delete_post(&self, id: PostId) -> Result<bool, StorageError> {
        let mut table = self.posts.write().await;
        match table.rows.remove(&id) {
            Some(post) => {
                table.titles.remove(&(post.owner_id, post.title));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_posts(&self, owner_id: UserId) -> Result<Vec<Post>, StorageError> {
        let table = self.posts.read().await;
        let mut posts: Vec<Post> = table
            .rows
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(posts)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStorage {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<ServiceSubscription, StorageError> {
        let record = ServiceSubscription {
            id: self.next_subscription_id(),
            owner_id: subscription.owner_id,
            service: subscription.service,
            credentials: subscription.credentials,
            alive: true,
        };
        self.subscriptions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<ServiceSubscription>, StorageError> {
        Ok(self.subscriptions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        let mut subs: Vec<ServiceSubscription> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn list_live_subscriptions(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<ServiceSubscription>, StorageError> {
        let mut subs = self.list_subscriptions(owner_id).await?;
        subs.retain(|s| s.alive);
        Ok(subs)
    }

    async fn update_credentials(
        &self,
        id: SubscriptionId,
        credentials: Credentials,
    ) -> Result<ServiceSubscription, StorageError> {
        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("ServiceSubscription", id))?;
        entry.credentials = credentials;
        entry.alive = true;
        Ok(entry.value().clone())
    }

    async fn deactivate_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        // get_mut holds the shard write lock for the read-then-write.
        match self.subscriptions.get_mut(&id) {
            Some(mut entry) if entry.alive => {
                entry.alive = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        Ok(self.subscriptions.remove(&id).is_some())
    }
}
