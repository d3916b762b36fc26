//! Notification router worker pool
//!
//! Workers lease batches from the durable queue, filter each message through
//! the recipient's preferences, dispatch to the channel adapter and record the
//! outcome in the delivery log.
//!
//! ```text
//! lease ──▶ already terminal? ──▶ poison? ──▶ route ──▶ deliver
//!                  │                │           │          │
//!                 ack          dead-letter   skipped    sent ──▶ ack
//!                                                       transient ──▶ requeue with backoff
//!                                                       permanent / retries spent ──▶ failed, ack
//! ```
//!
//! Routing is decided at the instant the fan-out was created, so every
//! channel of one notification sees the same quiet-hours and DND state no
//! matter when it is leased or retried.
//!
//! Store calls are synchronous SQLite round-trips and run on the blocking
//! pool. A store error while processing leaves the message leased; it
//! becomes visible again when the lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::adapter::{AdapterRegistry, DeliveryError, RenderedMessage};
use super::backoff::RetryPolicy;
use super::filter::{route, RouteDecision, SkipReason};
use crate::clock::SharedClock;
use crate::events::{OnCallEvent, SharedEventBus};
use crate::otel;
use crate::store::{
    DeliveryStatus, LeasedMessage, NotificationLog, NotificationRequest, Recipient, SharedStore,
    Store, StoreError, StoreResult,
};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Configuration for the router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub worker_count: usize,
    /// Messages leased per poll
    pub batch_size: usize,
    /// How long a lease hides a message from other workers
    pub visibility_timeout_secs: u64,
    /// Sleep between polls when the queue is empty
    pub poll_interval_ms: u64,
    /// Leases after which a message is dead-lettered
    pub max_deliveries: u32,
    pub retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 10,
            visibility_timeout_secs: 60,
            poll_interval_ms: 500,
            max_deliveries: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl RouterConfig {
    fn visibility(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_secs.min(i64::MAX as u64) as i64)
    }
}

/// What happened to one leased message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Sent,
    /// A terminal row already existed; acked without dispatch
    AlreadyDelivered,
    Skipped { reason: SkipReason },
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed { error: String },
    /// Redelivered too often without completing
    DeadLettered { delivery_count: u32 },
}

impl ProcessOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::AlreadyDelivered => "already_delivered",
            Self::Skipped { .. } => "skipped",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Counters accumulated by workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: usize,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Sent => self.sent += 1,
            ProcessOutcome::Skipped { .. } => self.skipped += 1,
            ProcessOutcome::Retrying { .. } => self.retried += 1,
            ProcessOutcome::Failed { .. } | ProcessOutcome::DeadLettered { .. } => self.failed += 1,
            ProcessOutcome::AlreadyDelivered => {}
        }
    }

    pub fn merge(&mut self, other: WorkerStats) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.failed += other.failed;
        self.errors += other.errors;
    }
}

/// Queue consumer and dispatcher
pub struct NotificationRouter {
    store: SharedStore,
    clock: SharedClock,
    adapters: AdapterRegistry,
    config: RouterConfig,
    events: Option<SharedEventBus>,
}

impl NotificationRouter {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        adapters: AdapterRegistry,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            clock,
            adapters,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn publish(&self, event: OnCallEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Put a request on the durable queue.
    pub fn enqueue(&self, request: &NotificationRequest) -> RouterResult<i64> {
        Ok(self.store.enqueue(request)?)
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> RouterResult<T>
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Lease one batch and process every message in it.
    ///
    /// Per-message store errors are logged and the message is left to its
    /// lease; they do not fail the batch.
    pub async fn poll_once(&self) -> RouterResult<Vec<ProcessOutcome>> {
        let now = self.clock.now();
        let limit = self.config.batch_size.max(1);
        let visibility = self.config.visibility();
        let batch = self
            .blocking(move |store| store.lease(now, limit, visibility))
            .await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for message in batch {
            let message_id = message.message_id;
            match self.process(message).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(message_id, "Message abandoned to lease expiry: {}", e),
            }
        }
        Ok(outcomes)
    }

    /// Process one leased message to an outcome.
    pub async fn process(&self, message: LeasedMessage) -> RouterResult<ProcessOutcome> {
        let span = otel::deliver_span(
            &message.request.notification_id,
            message.request.channel.as_str(),
            message.delivery_count,
        );
        let outcome = self.process_inner(&message).instrument(span.clone()).await?;
        let retry_count = match &outcome {
            ProcessOutcome::Retrying { retry_count, .. } => *retry_count,
            _ => message.request.retry_count,
        };
        otel::record_deliver_result(&span, outcome.label(), retry_count);
        Ok(outcome)
    }

    async fn process_inner(&self, message: &LeasedMessage) -> RouterResult<ProcessOutcome> {
        let request = &message.request;
        let now = self.clock.now();

        let notification_id = request.notification_id.clone();
        let channel = request.channel;
        let existing = self
            .blocking(move |store| store.delivery(&notification_id, channel))
            .await?;
        if let Some(existing) = existing {
            if existing.status.is_terminal() {
                debug!(
                    notification_id = %request.notification_id,
                    channel = %request.channel,
                    status = %existing.status,
                    "Already handled, acking duplicate"
                );
                self.ack(message).await?;
                return Ok(ProcessOutcome::AlreadyDelivered);
            }
        }

        if message.delivery_count > self.config.max_deliveries {
            let error = format!("exceeded {} deliveries", self.config.max_deliveries);
            warn!(
                notification_id = %request.notification_id,
                channel = %request.channel,
                delivery_count = message.delivery_count,
                "Dead-lettering poison message"
            );
            self.record(request, DeliveryStatus::Failed, request.retry_count, Some(&error), now)
                .await?;
            self.ack(message).await?;
            self.publish(OnCallEvent::NotificationFailed {
                notification_id: request.notification_id.clone(),
                incident_id: request.incident_id.clone(),
                channel: request.channel,
                error,
                timestamp: now,
            });
            return Ok(ProcessOutcome::DeadLettered {
                delivery_count: message.delivery_count,
            });
        }

        let (decision, address) = match &request.recipient {
            Recipient::User(user_id) => {
                let lookup_id = user_id.clone();
                let config = self
                    .blocking(move |store| store.notification_config_or_default(&lookup_id, now))
                    .await?;
                let decision = route(
                    &config,
                    request.channel,
                    &request.requested_channels,
                    request.priority,
                    request.created_at,
                );
                let address = config
                    .channel(request.channel)
                    .address
                    .clone()
                    .unwrap_or_else(|| user_id.clone());
                (decision, address)
            }
            Recipient::External(id) => (RouteDecision::Deliver, id.clone()),
        };

        if let RouteDecision::Skip(reason) = decision {
            let text = reason.to_string();
            debug!(
                notification_id = %request.notification_id,
                channel = %request.channel,
                reason = %text,
                "Channel skipped"
            );
            self.record(request, DeliveryStatus::Skipped, request.retry_count, Some(&text), now)
                .await?;
            self.ack(message).await?;
            self.publish(OnCallEvent::NotificationSkipped {
                notification_id: request.notification_id.clone(),
                incident_id: request.incident_id.clone(),
                channel: request.channel,
                reason: text,
                timestamp: now,
            });
            return Ok(ProcessOutcome::Skipped { reason });
        }

        self.record(request, DeliveryStatus::Pending, request.retry_count, None, now)
            .await?;
        let result = self.dispatch(request, &address).await;
        let now = self.clock.now();

        match result {
            Ok(()) => {
                self.record(request, DeliveryStatus::Sent, request.retry_count, None, now)
                    .await?;
                self.ack(message).await?;
                info!(
                    notification_id = %request.notification_id,
                    channel = %request.channel,
                    recipient = %request.recipient,
                    "Notification sent"
                );
                self.publish(OnCallEvent::NotificationSent {
                    notification_id: request.notification_id.clone(),
                    incident_id: request.incident_id.clone(),
                    channel: request.channel,
                    timestamp: now,
                });
                Ok(ProcessOutcome::Sent)
            }
            Err(DeliveryError::Transient(reason))
                if self.config.retry.should_retry(request.retry_count + 1) =>
            {
                let retry_count = request.retry_count + 1;
                let next_attempt_at = now + self.config.retry.backoff(retry_count);
                self.record(request, DeliveryStatus::Retrying, retry_count, Some(&reason), now)
                    .await?;
                let leased = message.clone();
                let requeued = self
                    .blocking(move |store| store.requeue(&leased, next_attempt_at, retry_count))
                    .await?;
                if !requeued {
                    warn!(message_id = message.message_id, "Lease lost before requeue");
                }
                warn!(
                    notification_id = %request.notification_id,
                    channel = %request.channel,
                    retry_count,
                    "Transient delivery failure, retrying: {}",
                    reason
                );
                self.publish(OnCallEvent::NotificationRetrying {
                    notification_id: request.notification_id.clone(),
                    incident_id: request.incident_id.clone(),
                    channel: request.channel,
                    retry_count,
                    next_attempt_at,
                    timestamp: now,
                });
                Ok(ProcessOutcome::Retrying {
                    retry_count,
                    next_attempt_at,
                })
            }
            Err(e) => {
                let (retry_count, error) = match &e {
                    DeliveryError::Transient(_) => (request.retry_count + 1, e.to_string()),
                    DeliveryError::Permanent(_) => (request.retry_count, e.to_string()),
                };
                self.record(request, DeliveryStatus::Failed, retry_count, Some(&error), now)
                    .await?;
                self.ack(message).await?;
                warn!(
                    notification_id = %request.notification_id,
                    channel = %request.channel,
                    "Delivery failed: {}",
                    error
                );
                self.publish(OnCallEvent::NotificationFailed {
                    notification_id: request.notification_id.clone(),
                    incident_id: request.incident_id.clone(),
                    channel: request.channel,
                    error: error.clone(),
                    timestamp: now,
                });
                Ok(ProcessOutcome::Failed { error })
            }
        }
    }

    async fn dispatch(&self, request: &NotificationRequest, address: &str) -> Result<(), DeliveryError> {
        let Some(adapter) = self.adapters.get(request.channel) else {
            return Err(DeliveryError::Permanent(format!(
                "no adapter for channel {}",
                request.channel
            )));
        };
        if address.is_empty() {
            return Err(DeliveryError::Permanent("no address".to_string()));
        }
        let message = RenderedMessage {
            notification_id: request.notification_id.clone(),
            incident_id: request.incident_id.clone(),
            recipient: request.recipient.clone(),
            priority: request.priority,
            subject: request.subject.clone(),
            body: request.body.clone(),
        };
        adapter.deliver(request.channel, address, &message).await
    }

    async fn record(
        &self,
        request: &NotificationRequest,
        status: DeliveryStatus,
        retry_count: u32,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> RouterResult<()> {
        let log = NotificationLog {
            notification_id: request.notification_id.clone(),
            channel: request.channel,
            recipient: request.recipient.clone(),
            incident_id: request.incident_id.clone(),
            status,
            retry_count,
            error_message: error.map(String::from),
            created_at: request.created_at,
            updated_at: now,
            sent_at: (status == DeliveryStatus::Sent).then_some(now),
        };
        self.blocking(move |store| store.record_delivery(&log)).await?;
        Ok(())
    }

    async fn ack(&self, message: &LeasedMessage) -> RouterResult<()> {
        let leased = message.clone();
        if !self.blocking(move |store| store.ack(&leased)).await? {
            warn!(message_id = message.message_id, "Lease lost before ack");
        }
        Ok(())
    }

    // =========================================================================
    // Worker pool
    // =========================================================================

    /// Poll until cancelled.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) -> WorkerStats {
        let span = otel::worker_span(worker_id);
        async move {
            let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
            let mut stats = WorkerStats::default();
            debug!(worker_id, "Router worker started");

            while !cancel.is_cancelled() {
                let idle = match self.poll_once().await {
                    Ok(outcomes) => {
                        for outcome in &outcomes {
                            stats.record(outcome);
                        }
                        outcomes.is_empty()
                    }
                    Err(e) => {
                        warn!(worker_id, "Queue poll failed: {}", e);
                        stats.errors += 1;
                        true
                    }
                };
                if idle {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }

            debug!(worker_id, processed = stats.processed, "Router worker stopped");
            stats
        }
        .instrument(span)
        .await
    }

    /// Run `worker_count` workers until `cancel` fires and return their
    /// combined counters.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> WorkerStats {
        let workers = self.config.worker_count.max(1);
        let mut join_set: JoinSet<WorkerStats> = JoinSet::new();
        for worker_id in 0..workers {
            let router = Arc::clone(&self);
            let cancel = cancel.clone();
            join_set.spawn(async move { router.run_worker(worker_id, cancel).await });
        }
        info!(workers, "Notification router started");

        let mut total = WorkerStats::default();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(stats) => total.merge(stats),
                Err(e) => warn!(error = %e, "Router worker panicked"),
            }
        }
        info!(
            processed = total.processed,
            sent = total.sent,
            failed = total.failed,
            "Notification router stopped"
        );
        total
    }
}
