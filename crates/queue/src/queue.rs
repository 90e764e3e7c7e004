//! Delivery queue: serialized, rate-limited webhook delivery.
//!
//! A single worker task owns the queue and multiplexes four event sources:
//! producer commands, the drain timer, the in-flight delivery and the
//! snapshot interval. Because every mutation of the queue happens on that
//! task, `enqueue`, the drain cycle and snapshots never interleave mid-update.
//!
//! Drain cycle:
//! 1. When the drain timer fires, pop the head item and start one delivery.
//! 2. Delivered → continue. Unknown webhook → purge the registration, drop
//!    the item. Any other failure → append the item at the tail.
//! 3. A failure with an HTTP 5xx status enters slowmode: the next cycle runs
//!    after the long cooldown.
//! 4. Otherwise the next cycle runs after the queue delay, or the worker goes
//!    idle when nothing is pending.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};

use herald_common::config::AppConfig;
use herald_common::types::MessagePayload;

use crate::error::{DeliveryError, QueueError};
use crate::registry::WebhookRegistry;
use crate::snapshot::SnapshotStore;
use crate::state::{QueueItem, QueueState};
use crate::transport::{SenderIdentity, WebhookTransport};

/// Default delay between two deliveries.
pub const DEFAULT_QUEUE_DELAY: Duration = Duration::from_millis(250);

/// Default cooldown after the remote answered with a 5xx.
pub const DEFAULT_SLOWMODE_DELAY: Duration = Duration::from_secs(300);

/// Default interval between two snapshots.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted snapshot interval (one year).
pub const MAX_BACKUP_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tuning knobs of a [`DeliveryQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_delay: Duration,
    pub slowmode_delay: Duration,
    pub backup_interval: Duration,
    pub snapshot_path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_delay: DEFAULT_QUEUE_DELAY,
            slowmode_delay: DEFAULT_SLOWMODE_DELAY,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            snapshot_path: PathBuf::from("queue.json"),
        }
    }
}

impl From<&AppConfig> for QueueConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            queue_delay: config.queue_delay(),
            slowmode_delay: config.slowmode_delay(),
            backup_interval: config.backup_interval(),
            snapshot_path: PathBuf::from(&config.queue_file),
        }
    }
}

/// What the drain loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    /// Nothing pending, no timer armed.
    Idle,
    /// The next drain cycle fires after `delay` (counted from when it was armed).
    Scheduled { delay: Duration },
    /// One delivery is in flight.
    Delivering,
}

impl DrainPhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, DrainPhase::Idle)
    }
}

/// Point-in-time view of a running queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Items waiting for delivery, excluding the one in flight.
    pub pending: usize,
    pub phase: DrainPhase,
    /// True while the cooldown after a remote 5xx is running.
    pub slowmode: bool,
}

enum Command {
    Enqueue(QueueItem),
    Backup(oneshot::Sender<Result<(), QueueError>>),
    Status(oneshot::Sender<QueueStatus>),
    Stop(oneshot::Sender<Result<(), QueueError>>),
}

/// Cloneable producer-side handle of a running queue.
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl QueueHandle {
    /// Append a message for `recipient_id`. Never blocks.
    pub fn enqueue(
        &self,
        recipient_id: impl Into<String>,
        auth_token: impl Into<String>,
        thread_id: Option<String>,
        payload: MessagePayload,
    ) {
        let item = QueueItem::new(recipient_id, auth_token, thread_id, payload);

        if let Err(mpsc::error::SendError(Command::Enqueue(item))) =
            self.commands.send(Command::Enqueue(item))
        {
            tracing::warn!(
                recipient_id = %item.recipient_id,
                "Delivery queue is stopped, dropping message"
            );
        }
    }

    /// Write a snapshot now.
    pub async fn backup(&self) -> Result<(), QueueError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Backup(reply))
            .map_err(|_| QueueError::Stopped)?;
        response.await.map_err(|_| QueueError::Stopped)?
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .map_err(|_| QueueError::Stopped)?;
        response.await.map_err(|_| QueueError::Stopped)
    }
}

/// A delivery queue that has not been started yet.
pub struct DeliveryQueue {
    config: QueueConfig,
    transport: Arc<dyn WebhookTransport>,
    registry: Arc<dyn WebhookRegistry>,
}

impl DeliveryQueue {
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn WebhookTransport>,
        registry: Arc<dyn WebhookRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
        }
    }

    /// Resolve the sender identity, restore the last snapshot and spawn the
    /// worker task.
    pub async fn start(self) -> Result<RunningQueue, QueueError> {
        let identity = self
            .transport
            .current_identity()
            .await
            .map_err(QueueError::Identity)?;

        let snapshot = SnapshotStore::new(&self.config.snapshot_path);
        let state = snapshot.try_restore().await.unwrap_or_default();

        let (commands, receiver) = mpsc::unbounded_channel();

        let mut worker = QueueWorker {
            config: self.config,
            state,
            snapshot,
            transport: self.transport,
            registry: self.registry,
            identity: Arc::new(identity),
            commands: receiver,
            timer: None,
            in_flight: None,
            slowmode: false,
        };

        if !worker.state.is_empty() {
            worker.schedule(worker.config.queue_delay);
        }

        tracing::info!(
            pending = worker.state.len(),
            queue_delay_ms = worker.config.queue_delay.as_millis() as u64,
            snapshot = %worker.snapshot.path().display(),
            "Delivery queue started"
        );

        let task = tokio::spawn(worker.run());

        Ok(RunningQueue {
            handle: QueueHandle { commands },
            task,
        })
    }
}

/// Lifecycle owner of a started queue.
pub struct RunningQueue {
    handle: QueueHandle,
    task: JoinHandle<()>,
}

impl RunningQueue {
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Write a final snapshot, cancel the timers and wait for the worker to
    /// exit. Pending items are persisted, not delivered.
    pub async fn stop(self) -> Result<(), QueueError> {
        let (reply, response) = oneshot::channel();
        self.handle
            .commands
            .send(Command::Stop(reply))
            .map_err(|_| QueueError::Stopped)?;
        let result = response.await.map_err(|_| QueueError::Stopped)?;

        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Delivery queue worker panicked");
        }

        result
    }
}

type DeliveryFuture = Pin<Box<dyn Future<Output = DeliveryOutcome> + Send>>;

#[derive(Debug)]
enum DeliveryOutcome {
    Delivered,
    Purged,
    Failed(DeliveryError),
}

struct ScheduledDrain {
    delay: Duration,
    sleep: Pin<Box<Sleep>>,
}

struct InFlight {
    item: QueueItem,
    delivery: DeliveryFuture,
}

struct QueueWorker {
    config: QueueConfig,
    state: QueueState,
    snapshot: SnapshotStore,
    transport: Arc<dyn WebhookTransport>,
    registry: Arc<dyn WebhookRegistry>,
    identity: Arc<SenderIdentity>,
    commands: mpsc::UnboundedReceiver<Command>,
    timer: Option<ScheduledDrain>,
    in_flight: Option<InFlight>,
    slowmode: bool,
}

impl QueueWorker {
    async fn run(mut self) {
        let period = backup_period(self.config.backup_interval);
        let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
        let mut backups = tokio::time::interval_at(start, period);
        backups.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Enqueue(item)) => self.enqueue(item),
                    Some(Command::Backup(reply)) => {
                        let _ = reply.send(self.backup().await);
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Stop(reply)) => {
                        let _ = reply.send(self.shutdown().await);
                        self.reject_late_commands();
                        return;
                    }
                    None => {
                        if let Err(e) = self.shutdown().await {
                            tracing::error!(error = %e, "Final queue backup failed");
                        }
                        return;
                    }
                },
                () = wait_timer(&mut self.timer), if self.timer.is_some() => self.notify(),
                outcome = wait_delivery(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.complete(outcome);
                }
                _ = backups.tick() => {
                    if let Err(e) = self.backup().await {
                        tracing::error!(error = %e, "Periodic queue backup failed");
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, item: QueueItem) {
        self.state.enqueue(item);
        if !self.phase().is_active() {
            self.schedule(self.config.queue_delay);
        }
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.state.len(),
            phase: self.phase(),
            slowmode: self.slowmode,
        }
    }

    fn phase(&self) -> DrainPhase {
        match (&self.in_flight, &self.timer) {
            (Some(_), _) => DrainPhase::Delivering,
            (None, Some(timer)) => DrainPhase::Scheduled { delay: timer.delay },
            (None, None) => DrainPhase::Idle,
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.timer = Some(ScheduledDrain {
            delay,
            sleep: Box::pin(tokio::time::sleep(delay)),
        });
    }

    /// Drain timer fired: start delivering the head item.
    fn notify(&mut self) {
        self.timer = None;
        self.slowmode = false;

        let Some(item) = self.state.dequeue() else {
            tracing::debug!("Queue drained, going idle");
            return;
        };

        let delivery = deliver(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            Arc::clone(&self.identity),
            item.clone(),
        );

        self.in_flight = Some(InFlight {
            item,
            delivery: Box::pin(delivery),
        });
    }

    /// The in-flight delivery finished: requeue on failure and pick the next delay.
    fn complete(&mut self, outcome: DeliveryOutcome) {
        let Some(InFlight { item, .. }) = self.in_flight.take() else {
            return;
        };

        if let DeliveryOutcome::Failed(err) = &outcome {
            tracing::error!(
                recipient_id = %item.recipient_id,
                thread_id = ?item.thread_id,
                body = ?item.payload,
                error = %err,
                "Unable to send webhook request"
            );
            self.state.enqueue(item);
        }

        if is_overload(&outcome) {
            tracing::warn!(
                status = ?outcome_status(&outcome),
                cooldown_secs = self.config.slowmode_delay.as_secs(),
                pending = self.state.len(),
                "Webhook provider is having issues, slowing down"
            );
            self.slowmode = true;
        }

        match next_delay(&outcome, self.state.len(), &self.config) {
            Some(delay) => self.schedule(delay),
            None => {
                self.timer = None;
                tracing::debug!("Queue empty, going idle");
            }
        }
    }

    /// Queue contents as they must be persisted: an abandoned in-flight item
    /// goes back in front so it is retried after a restart.
    fn snapshot_state(&self) -> QueueState {
        let mut state = self.state.clone();
        if let Some(in_flight) = &self.in_flight {
            state.requeue_front(in_flight.item.clone());
        }
        state
    }

    async fn backup(&mut self) -> Result<(), QueueError> {
        let state = self.snapshot_state();
        tracing::info!(length = state.len(), "Backing up queue");
        self.snapshot.write(&state).await
    }

    async fn shutdown(&mut self) -> Result<(), QueueError> {
        tracing::info!(
            length = self.state.len(),
            in_flight = self.in_flight.is_some(),
            "Stopping queue"
        );

        let result = self.backup().await;

        self.timer = None;
        if let Some(in_flight) = self.in_flight.take() {
            tracing::warn!(
                recipient_id = %in_flight.item.recipient_id,
                "Abandoning in-flight delivery, kept in snapshot"
            );
        }

        result
    }

    /// Commands that raced with `stop` are refused: enqueued items are
    /// dropped with a warning and waiting callers see `QueueError::Stopped`.
    fn reject_late_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Enqueue(item) = command {
                tracing::warn!(
                    recipient_id = %item.recipient_id,
                    "Delivery queue is stopped, dropping message"
                );
            }
        }
    }
}

/// Snapshot period, kept within what the timer wheel can represent.
fn backup_period(interval: Duration) -> Duration {
    interval.clamp(Duration::from_millis(1), MAX_BACKUP_INTERVAL)
}

/// Delay before the next drain cycle, or `None` to go idle.
fn next_delay(outcome: &DeliveryOutcome, pending: usize, config: &QueueConfig) -> Option<Duration> {
    if is_overload(outcome) {
        return Some(config.slowmode_delay);
    }

    (pending > 0).then_some(config.queue_delay)
}

fn is_overload(outcome: &DeliveryOutcome) -> bool {
    matches!(outcome, DeliveryOutcome::Failed(err) if err.is_server_error())
}

fn outcome_status(outcome: &DeliveryOutcome) -> Option<u16> {
    match outcome {
        DeliveryOutcome::Failed(err) => err.status(),
        _ => None,
    }
}

/// One outbound call, including the registry purge for a deleted webhook.
async fn deliver(
    transport: Arc<dyn WebhookTransport>,
    registry: Arc<dyn WebhookRegistry>,
    identity: Arc<SenderIdentity>,
    item: QueueItem,
) -> DeliveryOutcome {
    match transport.execute(&item, &identity).await {
        Ok(()) => {
            tracing::debug!(recipient_id = %item.recipient_id, "Webhook delivered");
            DeliveryOutcome::Delivered
        }
        Err(DeliveryError::UnknownWebhook) => {
            tracing::info!(recipient_id = %item.recipient_id, "Purging expired webhook");
            if let Err(e) = registry.purge(&item.recipient_id).await {
                tracing::error!(
                    recipient_id = %item.recipient_id,
                    error = %e,
                    "Failed to purge expired webhook"
                );
            }
            DeliveryOutcome::Purged
        }
        Err(e) => DeliveryOutcome::Failed(e),
    }
}

async fn wait_timer(timer: &mut Option<ScheduledDrain>) {
    match timer {
        Some(timer) => timer.sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn wait_delivery(in_flight: &mut Option<InFlight>) -> DeliveryOutcome {
    match in_flight {
        Some(in_flight) => in_flight.delivery.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    fn api_error(status: u16) -> DeliveryOutcome {
        DeliveryOutcome::Failed(DeliveryError::Api {
            status,
            code: None,
            message: "boom".to_string(),
        })
    }

    #[test]
    fn test_next_delay_after_success() {
        let config = config();
        assert_eq!(
            next_delay(&DeliveryOutcome::Delivered, 3, &config),
            Some(DEFAULT_QUEUE_DELAY)
        );
        assert_eq!(next_delay(&DeliveryOutcome::Delivered, 0, &config), None);
    }

    #[test]
    fn test_next_delay_after_purge() {
        let config = config();
        assert_eq!(next_delay(&DeliveryOutcome::Purged, 0, &config), None);
        assert_eq!(
            next_delay(&DeliveryOutcome::Purged, 1, &config),
            Some(DEFAULT_QUEUE_DELAY)
        );
    }

    #[test]
    fn test_next_delay_server_error_enters_slowmode() {
        let config = config();
        assert_eq!(
            next_delay(&api_error(503), 1, &config),
            Some(DEFAULT_SLOWMODE_DELAY)
        );
        assert_eq!(
            next_delay(&api_error(500), 1, &config),
            Some(DEFAULT_SLOWMODE_DELAY)
        );
    }

    #[test]
    fn test_next_delay_client_error_keeps_pace() {
        let config = config();
        assert_eq!(next_delay(&api_error(400), 1, &config), Some(DEFAULT_QUEUE_DELAY));
        let network = DeliveryOutcome::Failed(DeliveryError::Network("reset".to_string()));
        assert_eq!(next_delay(&network, 1, &config), Some(DEFAULT_QUEUE_DELAY));
    }

    #[test]
    fn test_backup_period_bounds() {
        assert_eq!(backup_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(backup_period(DEFAULT_BACKUP_INTERVAL), DEFAULT_BACKUP_INTERVAL);
        assert_eq!(backup_period(Duration::MAX), MAX_BACKUP_INTERVAL);
        assert_eq!(
            backup_period(Duration::from_millis(u64::MAX)),
            MAX_BACKUP_INTERVAL
        );
    }

    #[test]
    fn test_drain_phase_activity() {
        assert!(!DrainPhase::Idle.is_active());
        assert!(DrainPhase::Delivering.is_active());
        assert!(
            DrainPhase::Scheduled {
                delay: DEFAULT_QUEUE_DELAY
            }
            .is_active()
        );
    }
}
