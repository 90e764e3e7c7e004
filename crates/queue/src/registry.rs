//! Webhook registry: the relational store of channel webhook registrations.

use async_trait::async_trait;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::WebhookRegistration;

/// Lookup and removal of webhook registrations.
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    /// Delete every registration of `webhook_id`. Idempotent; returns rows removed.
    async fn purge(&self, webhook_id: &str) -> Result<u64, AppError>;

    /// One registration per guild, the oldest one, for announcements.
    async fn broadcast_targets(&self) -> Result<Vec<WebhookRegistration>, AppError>;
}

/// PostgreSQL-backed registry over the `channel_webhook` table.
#[derive(Clone)]
pub struct PgWebhookRegistry {
    pool: PgPool,
}

impl PgWebhookRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRegistry for PgWebhookRegistry {
    async fn purge(&self, webhook_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM channel_webhook WHERE webhook_id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        tracing::info!(webhook_id, removed, "Purged expired webhook");

        Ok(removed)
    }

    async fn broadcast_targets(&self) -> Result<Vec<WebhookRegistration>, AppError> {
        let targets: Vec<WebhookRegistration> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (guild_id) *
            FROM channel_webhook
            ORDER BY guild_id, created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(targets)
    }
}
