pub mod telegram;

pub use telegram::{TelegramAdapter, TelegramConfig};

use std::sync::Arc;

use async_trait::async_trait;
use words_storage::{Credentials, ServiceKind};

use crate::error::DeliveryError;

/// Pushes a post notification to one external service.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Sends `title` and `url` to the target described by `credentials`.
    async fn send(
        &self,
        credentials: &Credentials,
        title: &str,
        url: &str,
    ) -> Result<(), DeliveryError>;
}

/// Adapters by service kind.
///
/// Lookup is an exhaustive `match`: adding a [`ServiceKind`] does not compile
/// until this registry decides what serves it.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    telegram: Option<Arc<dyn ServiceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter serving [`ServiceKind::Telegram`].
    #[must_use]
    pub fn with_telegram(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.telegram = Some(adapter);
        self
    }

    /// Returns the adapter for a kind, or `None` if the kind is not implemented.
    pub fn get(&self, kind: ServiceKind) -> Option<&Arc<dyn ServiceAdapter>> {
        match kind {
            ServiceKind::Telegram => self.telegram.as_ref(),
            // No Twitter client exists yet.
            ServiceKind::Twitter => None,
        }
    }

    pub fn supports(&self, kind: ServiceKind) -> bool {
        self.get(kind).is_some()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let supported: Vec<&str> = ServiceKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .map(ServiceKind::as_str)
            .collect();
        f.debug_struct("AdapterRegistry")
            .field("supported", &supported)
            .finish()
    }
}
