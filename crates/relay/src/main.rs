use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_queue::{DeliveryQueue, DiscordClient, DiscordConfig, PgWebhookRegistry, QueueConfig};
use herald_relay::broadcast::BroadcastWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_relay=info,herald_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald relay starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let discord = DiscordClient::new(DiscordConfig {
        api_url: config.discord_api_url.clone(),
        bot_token: config.discord_bot_token.clone(),
        timeout: config.http_timeout(),
    })?;
    let registry = Arc::new(PgWebhookRegistry::new(pool));

    let queue = DeliveryQueue::new(
        QueueConfig::from(&config),
        Arc::new(discord),
        registry.clone(),
    )
    .start()
    .await?;

    let broadcasts = tokio::spawn(
        BroadcastWorker::new(
            &config.broadcast_file,
            config.broadcast_interval(),
            queue.handle(),
            registry,
        )
        .run(),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    broadcasts.abort();
    if let Err(e) = queue.stop().await {
        tracing::error!(error = %e, "Failed to persist delivery queue on shutdown");
        return Err(e.into());
    }

    tracing::info!("Herald relay stopped.");
    Ok(())
}
