use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message body handed to the delivery queue.
///
/// The queue passes it through untouched; only producers and the webhook
/// transport look inside. `embeds` and `components` are kept as raw JSON so
/// any Discord object shape survives a snapshot round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub components: Vec<serde_json::Value>,
}

impl MessagePayload {
    /// Plain text message without embeds or components.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// A channel's webhook registration, as stored in `channel_webhook`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub guild_id: String,
    pub channel_id: String,
    pub webhook_id: String,
    pub webhook_token: String,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults_missing_collections() {
        let payload: MessagePayload =
            serde_json::from_value(serde_json::json!({ "content": "hello" })).unwrap();
        assert_eq!(payload, MessagePayload::text("hello"));
    }

    #[test]
    fn test_payload_keeps_unknown_embed_fields() {
        let embed = serde_json::json!({
            "title": "Patch notes",
            "color": 1_752_220,
            "footer": { "text": "v1.2" }
        });
        let payload: MessagePayload =
            serde_json::from_value(serde_json::json!({ "embeds": [embed.clone()] })).unwrap();
        assert_eq!(payload.content, None);
        assert_eq!(payload.embeds, vec![embed]);

        let serialized = serde_json::to_value(&payload).unwrap();
        assert!(serialized.get("content").is_none());
        assert_eq!(serialized["components"], serde_json::json!([]));
    }
}
