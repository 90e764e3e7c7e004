//! Outbound delivery seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::state::QueueItem;

/// Display name and avatar stamped on every delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub username: String,
    pub avatar_url: String,
}

/// Transport able to execute one webhook call.
///
/// Implementations must report a deleted recipient as
/// [`DeliveryError::UnknownWebhook`] and carry the HTTP status of any other
/// non-2xx response so the queue can tell overload apart from bad input.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Identity of the sending account. Resolved once per process.
    async fn current_identity(&self) -> Result<SenderIdentity, DeliveryError>;

    /// Deliver `item` to its recipient, signed as `identity`.
    async fn execute(
        &self,
        item: &QueueItem,
        identity: &SenderIdentity,
    ) -> Result<(), DeliveryError>;
}
