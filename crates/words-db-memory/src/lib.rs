//! In-memory storage backend for the words repost pipeline.
//!
//! This crate provides an in-memory implementation of the `PostStore` and
//! `SubscriptionStore` traits from `words-storage`. It backs single-process
//! deployments and the pipeline's test suites.
//!
//! # Example
//!
//! ```ignore
//! use words_db_memory::InMemoryStorage;
//! use words_storage::{NewPost, PostStore, UserId};
//!
//! let storage = InMemoryStorage::new();
//! let post = storage
//!     .create_post(NewPost::new(UserId(1), "Hello", "first post #intro"))
//!     .await?;
//! ```

pub mod storage;

pub use storage::InMemoryStorage;

// Re-export the storage traits for convenience
pub use words_storage::{PostStore, StorageError, SubscriptionStore};

/// Creates a new shareable in-memory storage instance.
pub fn create_storage() -> std::sync::Arc<InMemoryStorage> {
    std::sync::Arc::new(InMemoryStorage::new())
}
