//! Consumer Loop: one queue, one message in flight, ack on success.
//!
//! Per delivery:
//! 1. decode the body into an [`Envelope`]
//! 2. await the service's [`EventHandler`]
//! 3. ack on success, nack with requeue on any failure
//!
//! Failed attempts are counted per message. Once a message reaches the
//! configured limit it is moved to the service's dead-letter queue instead
//! of being requeued forever.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use super::topology::dead_letter_queue_for;
use super::{BrokerSession, Delivery, OutboundMessage, Result};
use crate::envelope::Envelope;

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH: u16 = 1;

/// Default failed attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Header naming the queue a dead letter came from.
pub const DLQ_SOURCE_QUEUE_HEADER: &str = "x-orderbus-source-queue";
/// Header carrying the number of failed attempts.
pub const DLQ_ATTEMPTS_HEADER: &str = "x-orderbus-attempts";
/// Header carrying the last failure reason.
pub const DLQ_REASON_HEADER: &str = "x-orderbus-reason";

/// Upper bound on tracked failing messages.
const MAX_TRACKED_MESSAGES: usize = 1024;

// ============================================================================
// Handler
// ============================================================================

/// Errors a handler can report. Any error requeues the message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid '{event_type}' payload: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Failed(String),
}

/// Service-specific reaction to events.
///
/// The consumer loop owns the handler and calls it strictly sequentially,
/// so handler state needs no synchronization.
#[async_trait]
pub trait EventHandler: Send {
    /// Service name for logs.
    fn name(&self) -> &str;

    async fn handle(&mut self, envelope: &Envelope) -> std::result::Result<(), HandlerError>;

    /// Period of [`on_tick`](Self::on_tick), if the handler wants one.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Called once, after the first subscription succeeds.
    async fn on_start(&mut self) {}

    /// Called between deliveries on every tick.
    async fn on_tick(&mut self) {}

    /// Called once after the loop stops for shutdown.
    async fn on_shutdown(&mut self) {}
}

// ============================================================================
// Redelivery policy
// ============================================================================

/// What to do with a message that keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryPolicy {
    /// Requeue forever.
    Unbounded,
    /// Dead-letter after this many failed attempts.
    DeadLetterAfter(u32),
}

impl RedeliveryPolicy {
    /// `0` means unbounded.
    pub fn from_max_attempts(max_attempts: u32) -> Self {
        if max_attempts == 0 {
            RedeliveryPolicy::Unbounded
        } else {
            RedeliveryPolicy::DeadLetterAfter(max_attempts)
        }
    }

    pub fn uses_dead_letter(&self) -> bool {
        matches!(self, RedeliveryPolicy::DeadLetterAfter(_))
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        RedeliveryPolicy::DeadLetterAfter(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }
}

/// Failed-attempt counts keyed by message identity.
#[derive(Debug, Default)]
struct AttemptTracker {
    failures: HashMap<String, u32>,
}

impl AttemptTracker {
    fn record_failure(&mut self, key: &str) -> u32 {
        if self.failures.len() >= MAX_TRACKED_MESSAGES && !self.failures.contains_key(key) {
            self.failures.clear();
        }
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Why [`ConsumerLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Shutdown was requested; the in-progress message, if any, was settled.
    Shutdown,
    /// The delivery stream ended without a shutdown request.
    StreamEnded,
}

/// Outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
}

/// Sequential consumer for one queue.
pub struct ConsumerLoop {
    queue: String,
    consumer_tag: String,
    handler: Box<dyn EventHandler>,
    policy: RedeliveryPolicy,
    attempts: AttemptTracker,
    started: bool,
    processed: u64,
    requeued: u64,
    dead_lettered: u64,
}

impl ConsumerLoop {
    pub fn new(queue: impl Into<String>, handler: Box<dyn EventHandler>, policy: RedeliveryPolicy) -> Self {
        let queue = queue.into();
        let consumer_tag = format!("{}-{}", handler.name(), uuid::Uuid::new_v4());
        Self {
            queue,
            consumer_tag,
            handler,
            policy,
            attempts: AttemptTracker::default(),
            started: false,
            processed: 0,
            requeued: 0,
            dead_lettered: 0,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Messages acknowledged after successful handling.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Failed attempts returned to the queue.
    pub fn requeued(&self) -> u64 {
        self.requeued
    }

    /// Messages moved to the dead-letter queue.
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered
    }

    /// Let the handler flush its state before the process exits.
    pub async fn finish(&mut self) {
        info!(
            queue = %self.queue,
            processed = self.processed,
            requeued = self.requeued,
            dead_lettered = self.dead_lettered,
            "Consumer finished"
        );
        self.handler.on_shutdown().await;
    }

    /// Consume until shutdown is requested or the stream ends.
    ///
    /// Shutdown is only observed between deliveries: a message being handled
    /// is always acked or nacked before this returns.
    pub async fn run(
        &mut self,
        session: &dyn BrokerSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConsumerExit> {
        if *shutdown.borrow() {
            return Ok(ConsumerExit::Shutdown);
        }

        let mut deliveries = session
            .consume(&self.queue, &self.consumer_tag, PREFETCH)
            .await?;
        let mut ticker = self.handler.tick_interval().map(periodic);

        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            prefetch = PREFETCH,
            "Consuming"
        );
        if !self.started {
            self.started = true;
            self.handler.on_start().await;
        }

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(queue = %self.queue, processed = self.processed, "Consumer stopping");
                        return Ok(ConsumerExit::Shutdown);
                    }
                }
                _ = next_tick(&mut ticker) => {
                    self.handler.on_tick().await;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        match self.process(session, delivery).await {
                            Settlement::Acked => {}
                            Settlement::Requeued => self.requeued += 1,
                            Settlement::DeadLettered => self.dead_lettered += 1,
                        }
                    }
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "Consumer delivery error");
                        return Ok(ConsumerExit::StreamEnded);
                    }
                    None => {
                        warn!(queue = %self.queue, "Consumer stream ended");
                        return Ok(ConsumerExit::StreamEnded);
                    }
                },
            }
        }
    }

    async fn process(&mut self, session: &dyn BrokerSession, delivery: Delivery) -> Settlement {
        let span = tracing::info_span!(
            "bus.consume",
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered
        );
        self.settle(session, delivery).instrument(span).await
    }

    async fn settle(&mut self, session: &dyn BrokerSession, delivery: Delivery) -> Settlement {
        let envelope = match Envelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Failed to decode envelope");
                let key = body_key(&delivery.payload);
                return self.fail(session, delivery, &key, &e.to_string()).await;
            }
        };

        info!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            timestamp = %envelope.timestamp,
            handler = %self.handler.name(),
            "Event received"
        );

        match self.handler.handle(&envelope).await {
            Ok(()) => {
                self.attempts.forget(&envelope.event_id);
                match delivery.ack().await {
                    Ok(()) => {
                        self.processed += 1;
                        debug!(event_id = %envelope.event_id, "Event acknowledged");
                    }
                    // The broker redelivers once it notices the channel is gone
                    Err(e) => error!(event_id = %envelope.event_id, error = %e, "Failed to ack message"),
                }
                Settlement::Acked
            }
            Err(e) => {
                error!(event_id = %envelope.event_id, error = %e, "Handler failed");
                self.fail(session, delivery, &envelope.event_id, &e.to_string())
                    .await
            }
        }
    }

    async fn fail(
        &mut self,
        session: &dyn BrokerSession,
        delivery: Delivery,
        key: &str,
        reason: &str,
    ) -> Settlement {
        let attempts = self.attempts.record_failure(key);

        if let RedeliveryPolicy::DeadLetterAfter(max) = self.policy {
            if attempts >= max {
                let target = dead_letter_queue_for(&self.queue);
                let message = OutboundMessage::persistent_json(delivery.payload.clone())
                    .with_header(DLQ_SOURCE_QUEUE_HEADER, self.queue.clone())
                    .with_header(DLQ_ATTEMPTS_HEADER, attempts.to_string())
                    .with_header(DLQ_REASON_HEADER, reason);

                match session.publish("", &target, message).await {
                    Ok(()) => {
                        self.attempts.forget(key);
                        warn!(attempts, dead_letter_queue = %target, "Message dead-lettered");
                        if let Err(e) = delivery.ack().await {
                            error!(error = %e, "Failed to ack dead-lettered message");
                        }
                        return Settlement::DeadLettered;
                    }
                    Err(e) => {
                        error!(error = %e, dead_letter_queue = %target, "Dead-letter publish failed, requeueing");
                    }
                }
            }
        }

        warn!(attempts, "Requeueing message");
        if let Err(e) = delivery.nack(true).await {
            error!(error = %e, "Failed to nack message");
        }
        Settlement::Requeued
    }
}

/// Identity of an undecodable body.
fn body_key(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
