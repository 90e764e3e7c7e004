//! Error types for webhook delivery and queue persistence.

use thiserror::Error;

/// Discord JSON error code for a webhook that no longer exists.
pub const UNKNOWN_WEBHOOK_CODE: u64 = 10015;

/// Failure of a single outbound webhook call.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The remote reports the webhook as deleted; retrying is pointless.
    #[error("unknown webhook")]
    UnknownWebhook,

    /// The remote answered with a non-2xx status.
    #[error("webhook API error: HTTP {status}: {message}")]
    Api {
        status: u16,
        code: Option<u64>,
        message: String,
    },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response whose body could not be understood.
    #[error("decode error: {0}")]
    Decode(String),
}

impl DeliveryError {
    pub fn is_unknown_webhook(&self) -> bool {
        matches!(self, DeliveryError::UnknownWebhook)
    }

    /// True when the remote reported an HTTP 5xx, i.e. it is overloaded.
    pub fn is_server_error(&self) -> bool {
        matches!(self, DeliveryError::Api { status, .. } if *status >= 500)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by queue lifecycle operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("snapshot I/O error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sender identity lookup failed: {0}")]
    Identity(#[source] DeliveryError),

    #[error("queue has been stopped")]
    Stopped,
}
