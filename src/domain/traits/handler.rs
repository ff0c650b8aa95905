use async_trait::async_trait;

use crate::application::errors::BotError;
use crate::domain::entities::{Message, SubscriptionMessage};

/// Business logic run by a dispatch worker for one unit of work.
///
/// Called synchronously inside the worker; an error or panic affects only
/// the unit being handled.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Handle one inbound update (message, command or callback)
    async fn handle_update(&self, update: Message) -> Result<(), BotError>;

    /// Deliver one subscription message to its recipient
    async fn handle_subscription(&self, message: SubscriptionMessage) -> Result<(), BotError>;
}
