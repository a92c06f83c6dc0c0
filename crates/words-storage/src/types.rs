//! Storage types for the words storage abstraction layer.
//!
//! This module defines the records the repost pipeline reads and writes:
//! posts and external-service subscriptions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::markdown;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Returns the raw database value.
            #[must_use]
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

record_id!(
    /// Identifier of a registered user (the owner of posts and subscriptions).
    UserId
);
record_id!(
    /// Identifier of a post. Stable once assigned.
    PostId
);
record_id!(
    /// Identifier of a service subscription.
    SubscriptionId
);

/// External service a subscription reposts to.
///
/// The set is closed: adding a kind means touching every exhaustive `match`
/// over it, including adapter registration and queue routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceKind {
    Telegram,
    Twitter,
}

impl ServiceKind {
    /// All known service kinds.
    pub const ALL: [ServiceKind; 2] = [ServiceKind::Telegram, ServiceKind::Twitter];

    /// Name used for persistence.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "TELEGRAM",
            Self::Twitter => "TWITTER",
        }
    }

    /// Lowercase name used in task names and log fields.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Twitter => "twitter",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TELEGRAM" => Ok(Self::Telegram),
            "TWITTER" => Ok(Self::Twitter),
            other => Err(StorageError::invalid_data(format!(
                "unknown service kind: {other}"
            ))),
        }
    }
}

/// Service-specific credential blob (a JSON object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Map<String, Value>);

impl Credentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a string entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Value::String(value.into()));
        self
    }

    /// Returns a string entry, if present and a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value for persistence.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Credentials {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StorageError::invalid_data(format!(
                "credentials must be a JSON object, got {other}"
            ))),
        }
    }
}

/// A published post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub owner_id: UserId,
    pub title: String,
    /// Markdown source.
    pub body: String,
    /// Hashtags found in the body.
    pub tags: BTreeSet<String>,
    /// Estimated reading time in minutes.
    pub reading_time: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub edited_at: OffsetDateTime,
}

impl Post {
    /// Builds a post from a draft, deriving tags and reading time from the body.
    #[must_use]
    pub fn from_draft(id: PostId, draft: NewPost, now: OffsetDateTime) -> Self {
        let tags = markdown::extract_tags(&draft.body);
        let reading_time = markdown::reading_time_minutes(&draft.body);
        Self {
            id,
            owner_id: draft.owner_id,
            title: draft.title,
            body: draft.body,
            tags,
            reading_time,
            created_at: now,
            edited_at: now,
        }
    }

    /// Applies an edit, re-deriving tags and reading time when the body changes.
    pub fn apply(&mut self, update: PostUpdate, now: OffsetDateTime) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(body) = update.body {
            self.tags = markdown::extract_tags(&body);
            self.reading_time = markdown::reading_time_minutes(&body);
            self.body = body;
        }
        self.edited_at = now;
    }
}

/// Input for creating a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub owner_id: UserId,
    pub title: String,
    pub body: String,
}

impl NewPost {
    pub fn new(owner_id: UserId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            owner_id,
            title: title.into(),
            body: body.into(),
        }
    }

    /// Checks field-level invariants shared by all backends.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_title(&self.title)
    }
}

/// Partial update of a post. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
}

impl PostUpdate {
    pub fn validate(&self) -> Result<(), StorageError> {
        match &self.title {
            Some(title) => validate_title(title),
            None => Ok(()),
        }
    }
}

/// Maximum title length, matching the `post.title` column.
pub const MAX_TITLE_LEN: usize = 256;

fn validate_title(title: &str) -> Result<(), StorageError> {
    if title.trim().is_empty() {
        return Err(StorageError::invalid_data("post title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(StorageError::invalid_data(format!(
            "post title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(())
}

/// A user's configured external channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSubscription {
    pub id: SubscriptionId,
    pub owner_id: UserId,
    pub service: ServiceKind,
    pub credentials: Credentials,
    /// `false` once a delivery was rejected permanently.
    pub alive: bool,
}

/// Input for creating a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub owner_id: UserId,
    pub service: ServiceKind,
    pub credentials: Credentials,
}

impl NewSubscription {
    pub fn new(owner_id: UserId, service: ServiceKind, credentials: Credentials) -> Self {
        Self {
            owner_id,
            service,
            credentials,
        }
    }
}
