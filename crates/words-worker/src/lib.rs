//! Worker daemon for the words repost pipeline.
//!
//! Loads [`config::AppConfig`], opens the configured backend and runs a
//! [`app::Worker`] until interrupted.

pub mod app;
pub mod config;
pub mod observability;

pub use app::{Backends, Worker, build_adapters};
pub use config::AppConfig;
