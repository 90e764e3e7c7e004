//! Broadcast worker: one-off announcements to every guild.
//!
//! An operator drops a `broadcast.json` document next to the relay:
//!
//! ```json
//! { "active": true, "message": { "content": "...", "embeds": [ ... ] } }
//! ```
//!
//! On its next tick the worker stamps the embeds with the current time,
//! queues the message once per guild and flips `active` to `false`, so a
//! broadcast is sent at most once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use herald_common::types::MessagePayload;
use herald_queue::{QueueHandle, WebhookRegistry};

/// Contents of the broadcast document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub active: bool,
    pub message: MessagePayload,
}

/// Result of a single broadcast check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// No readable broadcast document.
    Missing,
    /// A document exists but was already sent or is disabled.
    Inactive,
    /// The message was queued for this many guilds.
    Queued(usize),
}

/// Periodic producer feeding broadcasts into the delivery queue.
pub struct BroadcastWorker {
    path: PathBuf,
    interval: Duration,
    queue: QueueHandle,
    registry: Arc<dyn WebhookRegistry>,
}

impl BroadcastWorker {
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        queue: QueueHandle,
        registry: Arc<dyn WebhookRegistry>,
    ) -> Self {
        Self {
            path: path.into(),
            interval,
            queue,
            registry,
        }
    }

    /// Check for a broadcast every `interval` until one has been queued.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.work().await {
                Ok(BroadcastOutcome::Queued(_)) => {
                    tracing::info!("Broadcast queued, stopping broadcast worker");
                    return;
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Broadcast check failed"),
            }
        }
    }

    /// Run one broadcast check.
    pub async fn work(&self) -> anyhow::Result<BroadcastOutcome> {
        let Some(broadcast) = self.read().await else {
            tracing::warn!(path = %self.path.display(), "No broadcast found");
            return Ok(BroadcastOutcome::Missing);
        };

        if !broadcast.active {
            tracing::info!("Skipping inactive broadcast");
            return Ok(BroadcastOutcome::Inactive);
        }

        let mut message = broadcast.message;
        stamp_embeds(&mut message, &Utc::now().to_rfc3339());

        let targets = self.registry.broadcast_targets().await?;
        tracing::info!(guilds = targets.len(), "Queueing broadcast");

        for target in &targets {
            self.queue.enqueue(
                &target.webhook_id,
                &target.webhook_token,
                target.thread_id.clone(),
                message.clone(),
            );
        }

        let sent = Broadcast {
            active: false,
            message,
        };
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&sent)?).await?;

        Ok(BroadcastOutcome::Queued(targets.len()))
    }

    async fn read(&self) -> Option<Broadcast> {
        let raw = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(broadcast) => Some(broadcast),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Broadcast file unreadable");
                None
            }
        }
    }
}

/// Set `timestamp` on every embed object.
fn stamp_embeds(message: &mut MessagePayload, timestamp: &str) {
    for embed in message.embeds.iter_mut() {
        if let Some(fields) = embed.as_object_mut() {
            fields.insert("timestamp".to_string(), timestamp.into());
        }
    }
}
