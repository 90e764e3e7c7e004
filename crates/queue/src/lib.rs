//! Durable, rate-limited delivery of webhook notifications.
//!
//! Producers push messages through a [`QueueHandle`]; a single worker task
//! delivers them one at a time through a [`WebhookTransport`], purges deleted
//! webhooks through a [`WebhookRegistry`], backs off when the provider
//! returns 5xx, and snapshots its state so pending messages survive restarts.

pub mod discord;
pub mod error;
pub mod queue;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use discord::{DiscordClient, DiscordConfig};
pub use error::{DeliveryError, QueueError};
pub use queue::{DeliveryQueue, DrainPhase, QueueConfig, QueueHandle, QueueStatus, RunningQueue};
pub use registry::{PgWebhookRegistry, WebhookRegistry};
pub use snapshot::SnapshotStore;
pub use state::{QueueItem, QueueState};
pub use transport::{SenderIdentity, WebhookTransport};
