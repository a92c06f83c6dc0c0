//! # words-storage
//!
//! Storage abstraction layer for the words repost pipeline.
//!
//! This crate defines the records and traits that all storage backends must implement.
//! It does not contain any implementations - those are provided by `words-db-memory`
//! and `words-db-postgres`.
//!
//! ## Overview
//!
//! - [`PostStore`]: posts owned by a user, with tags derived from the Markdown body
//! - [`SubscriptionStore`]: per-user external service subscriptions and their liveness flag
//!
//! ## Example
//!
//! ```ignore
//! use words_storage::{SubscriptionStore, ServiceSubscription, StorageError, UserId};
//!
//! async fn live_channels(
//!     store: &dyn SubscriptionStore,
//!     owner: UserId,
//! ) -> Result<Vec<ServiceSubscription>, StorageError> {
//!     store.list_live_subscriptions(owner).await
//! }
//! ```

mod error;
pub mod markdown;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{PostStore, Storage, SubscriptionStore};
pub use types::{
    Credentials, MAX_TITLE_LEN, NewPost, NewSubscription, Post, PostId, PostUpdate, ServiceKind,
    ServiceSubscription, SubscriptionId, UserId,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared post store.
pub type DynPostStore = std::sync::Arc<dyn PostStore>;

/// Type alias for a shared subscription store.
pub type DynSubscriptionStore = std::sync::Arc<dyn SubscriptionStore>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use words_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::traits::{PostStore, Storage, SubscriptionStore};
    pub use crate::types::{
        Credentials, NewPost, NewSubscription, Post, PostId, PostUpdate, ServiceKind,
        ServiceSubscription, SubscriptionId, UserId,
    };
    pub use crate::{DynPostStore, DynSubscriptionStore, StorageResult};
}
