//! Discord REST implementation of [`WebhookTransport`].
//!
//! Webhooks are executed with `POST /webhooks/{id}/{token}`; the sending
//! identity comes from `GET /users/@me` with the bot token and is memoized for
//! the lifetime of the client. A 429 is waited out (`retry_after`) and the
//! request retried a few times before the error reaches the queue.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{DeliveryError, UNKNOWN_WEBHOOK_CODE};
use crate::state::QueueItem;
use crate::transport::{SenderIdentity, WebhookTransport};

const CDN_URL: &str = "https://cdn.discordapp.com";

/// Retries of a single webhook call after a 429.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Wait used when a 429 carries no usable `retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Longest `retry_after` honoured; anything above is capped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Configuration for [`DiscordClient`].
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// REST base URL, e.g. `https://discord.com/api/v10`
    pub api_url: String,
    /// Bot token, sent as `Authorization: Bot <token>` for identity lookup
    pub bot_token: String,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Discord webhook client.
pub struct DiscordClient {
    http: reqwest::Client,
    config: DiscordConfig,
    identity: OnceCell<SenderIdentity>,
}

/// Request body of "Execute Webhook".
#[derive(Debug, Serialize)]
struct ExecuteWebhookBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    username: &'a str,
    avatar_url: &'a str,
    embeds: &'a [serde_json::Value],
    components: &'a [serde_json::Value],
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    id: String,
    username: String,
    avatar: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    code: Option<u64>,
    message: Option<String>,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("herald-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            identity: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn fetch_identity(&self) -> Result<SenderIdentity, DeliveryError> {
        let response = self
            .http
            .get(self.url("/users/@me"))
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.to_string()))?;

        let response = error_for_status(response).await?;
        let user: CurrentUser = response
            .json()
            .await
            .map_err(|e| DeliveryError::Decode(e.to_string()))?;

        let avatar_url = avatar_url(&user.id, user.avatar.as_deref());
        tracing::info!(username = %user.username, "Resolved sender identity");

        Ok(SenderIdentity {
            username: user.username,
            avatar_url,
        })
    }
}

#[async_trait]
impl WebhookTransport for DiscordClient {
    async fn current_identity(&self) -> Result<SenderIdentity, DeliveryError> {
        self.identity
            .get_or_try_init(|| self.fetch_identity())
            .await
            .cloned()
    }

    async fn execute(
        &self,
        item: &QueueItem,
        identity: &SenderIdentity,
    ) -> Result<(), DeliveryError> {
        let body = ExecuteWebhookBody {
            content: item.payload.content.as_deref(),
            username: &identity.username,
            avatar_url: &identity.avatar_url,
            embeds: &item.payload.embeds,
            components: &item.payload.components,
        };

        let url = self.url(&format!(
            "/webhooks/{}/{}",
            item.recipient_id, item.auth_token
        ));
        let mut retries = 0;

        loop {
            let mut request = self.http.post(&url).json(&body);
            if let Some(thread_id) = &item.thread_id {
                request = request.query(&[("thread_id", thread_id)]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| DeliveryError::Network(e.to_string()))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS
                && retries < MAX_RATE_LIMIT_RETRIES
            {
                retries += 1;
                let wait = rate_limit_wait(response).await;
                tracing::warn!(
                    recipient_id = %item.recipient_id,
                    retry_after_ms = wait.as_millis() as u64,
                    retries,
                    "Rate limited by Discord, retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            error_for_status(response).await?;
            return Ok(());
        }
    }
}

/// How long a 429 asks us to wait.
async fn rate_limit_wait(response: Response) -> Duration {
    let header = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = response.text().await.unwrap_or_default();

    parse_retry_after(header.as_deref(), &body)
}

/// Read `retry_after` (seconds) from the body, falling back to the
/// `Retry-After` header, capped at [`MAX_RETRY_AFTER`].
fn parse_retry_after(header: Option<&str>, body: &str) -> Duration {
    let from_body = serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .and_then(|parsed| parsed.retry_after);
    let from_header = header.and_then(|value| value.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
        .min(MAX_RETRY_AFTER)
}

/// Map a non-2xx response to a [`DeliveryError`], passing 2xx through.
async fn error_for_status(response: Response) -> Result<Response, DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    Err(classify_error(status.as_u16(), &text))
}

fn classify_error(status: u16, body: &str) -> DeliveryError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();

    if parsed.code == Some(UNKNOWN_WEBHOOK_CODE) {
        return DeliveryError::UnknownWebhook;
    }

    DeliveryError::Api {
        status,
        code: parsed.code,
        message: parsed.message.unwrap_or_else(|| body.to_string()),
    }
}

/// CDN URL of a user's avatar, falling back to the default avatar.
fn avatar_url(user_id: &str, avatar_hash: Option<&str>) -> String {
    match avatar_hash {
        Some(hash) => {
            let ext = if hash.starts_with("a_") { "gif" } else { "png" };
            format!("{CDN_URL}/avatars/{user_id}/{hash}.{ext}")
        }
        None => {
            let index = user_id.parse::<u64>().map(|id| (id >> 22) % 6).unwrap_or(0);
            format!("{CDN_URL}/embed/avatars/{index}.png")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avatar_url_static_and_animated() {
        assert_eq!(
            avatar_url("661531246417149952", Some("af98c26218e92227800aa827c8876039")),
            "https://cdn.discordapp.com/avatars/661531246417149952/af98c26218e92227800aa827c8876039.png"
        );
        assert_eq!(
            avatar_url("1", Some("a_1269e74af4df7417b13759eae50c83dc")),
            "https://cdn.discordapp.com/avatars/1/a_1269e74af4df7417b13759eae50c83dc.gif"
        );
    }

    #[test]
    fn test_avatar_url_default() {
        // (80351110224678912 >> 22) % 6 == 5
        assert_eq!(
            avatar_url("80351110224678912", None),
            "https://cdn.discordapp.com/embed/avatars/5.png"
        );
        assert_eq!(
            avatar_url("not-a-snowflake", None),
            "https://cdn.discordapp.com/embed/avatars/0.png"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            parse_retry_after(
                None,
                r#"{"message": "You are being rate limited.", "retry_after": 0.25, "global": false}"#
            ),
            Duration::from_millis(250)
        );
        // Body wins over the header
        assert_eq!(
            parse_retry_after(Some("7"), r#"{"retry_after": 2}"#),
            Duration::from_secs(2)
        );
        assert_eq!(parse_retry_after(Some("3"), ""), Duration::from_secs(3));
        assert_eq!(parse_retry_after(None, "slow down"), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("-1"), ""), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("86400"), ""), MAX_RETRY_AFTER);
    }

    #[test]
    fn test_classify_unknown_webhook() {
        let err = classify_error(404, r#"{"message": "Unknown Webhook", "code": 10015}"#);
        assert!(err.is_unknown_webhook());
    }

    #[test]
    fn test_classify_other_api_error() {
        let err = classify_error(
            400,
            r#"{"message": "Cannot send an empty message", "code": 50006}"#,
        );
        match err {
            DeliveryError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(code, Some(50006));
                assert_eq!(message, "Cannot send an empty message");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_non_json_body() {
        let err = classify_error(503, "upstream connect error");
        assert!(err.is_server_error());
        assert!(err.to_string().contains("upstream connect error"));
    }
}
