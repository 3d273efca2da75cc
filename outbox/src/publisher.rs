//! Timer-driven outbox drain cycle.
//!
//! # Overview
//!
//! The [`OutboxPublisher`] is the bridge between durable staging and the
//! broker: a single periodic task that fetches pending outbox records
//! oldest-first, forwards each stored payload verbatim through
//! [`EventBus::publish_raw`], and records the outcome. A separate, slower
//! cadence deletes published records older than the retention window.
//!
//! # Ordering
//!
//! Records are attempted strictly in ascending id order and each attempt is
//! synchronous: record N+1 is not attempted until record N's outcome is
//! recorded. There is deliberately no internal parallelism. Ordering is
//! best-effort, not a barrier: a record that keeps failing does not block
//! later records, trading strict ordering for liveness.
//!
//! # Failure Semantics
//!
//! Broker unavailability surfaces as a publish error on individual records;
//! they are retried on the next cycle, which bounds retry storms to the
//! poll interval. Store errors abort the current cycle early and the cycle
//! as a whole retries on the next tick. Nothing in the background loop is
//! ever fatal to the process.
//!
//! A record whose attempt counter reaches the configured maximum stops
//! being fetched and stays unpublished; it remains visible through
//! `OutboxStore::fetch_failed` for operator alerting and is never deleted
//! automatically.

use chrono::Utc;
use eventmesh_core::bus::EventBus;
use eventmesh_core::outbox::{OutboxRecord, OutboxStore, OutboxStoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Configuration for the outbox publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum number of records fetched and attempted per drain cycle.
    pub batch_size: i64,

    /// How often the drain cycle runs.
    pub poll_interval: Duration,

    /// Publish attempts before a record is considered permanently failed.
    pub max_retries: i32,

    /// Maximum rows deleted per cleanup batch, bounding transaction size.
    pub delete_batch_size: i64,

    /// How often the retention cleanup runs.
    pub cleanup_interval: Duration,

    /// How long published records are kept before deletion.
    pub retention: chrono::Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            max_retries: 3,
            delete_batch_size: 100,
            cleanup_interval: Duration::from_secs(60),
            retention: chrono::Duration::hours(24),
        }
    }
}

/// Drains the outbox store to the event bus.
///
/// One publisher instance runs per service instance; see the store-level
/// documentation for the single-writer contract.
///
/// # Example
///
/// ```ignore
/// let (publisher, shutdown) = OutboxPublisher::new(
///     store,
///     bus,
///     PublisherConfig::default(),
/// );
///
/// tokio::spawn(publisher.run());
///
/// // Later, on shutdown:
/// // shutdown.send(true).ok();
/// ```
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxPublisher {
    /// Create a new publisher over the given store and bus.
    ///
    /// Returns the publisher and a shutdown sender. Send `true` to stop the
    /// loop after the current cycle completes.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: PublisherConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publisher = Self {
            store,
            bus,
            config,
            shutdown: shutdown_rx,
        };

        (publisher, shutdown_tx)
    }

    /// Run the publisher until shutdown.
    ///
    /// Background cycle errors are logged and retried on the next tick;
    /// this method itself never fails.
    pub async fn run(mut self) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_retries = self.config.max_retries,
            "Starting outbox publisher"
        );

        let mut drain_tick = tokio::time::interval(self.config.poll_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(self.config.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = drain_tick.tick() => {
                    if let Err(e) = self.drain_cycle().await {
                        tracing::error!(error = %e, "outbox drain cycle aborted, retrying next tick");
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.cleanup_cycle().await {
                        tracing::error!(error = %e, "outbox cleanup cycle failed, retrying next tick");
                    }
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as a shutdown signal.
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    /// One drain pass: fetch a batch of pending records and attempt each in
    /// id order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError`] on any store failure, aborting the rest
    /// of the batch; the next tick retries from a fresh fetch.
    async fn drain_cycle(&self) -> Result<(), OutboxStoreError> {
        let records = self
            .store
            .fetch_pending(self.config.batch_size, self.config.max_retries)
            .await?;

        if records.is_empty() {
            return Ok(());
        }

        tracing::debug!(batch = records.len(), "Draining outbox batch");

        for record in records {
            self.attempt_publish(record).await?;
        }

        Ok(())
    }

    /// Attempt a single record: count the attempt, publish the stored bytes
    /// verbatim, retire the record on success.
    async fn attempt_publish(&self, record: OutboxRecord) -> Result<(), OutboxStoreError> {
        // The counter reflects every attempt, successful or not, so it is
        // bumped before the publish rather than only on failure.
        self.store.increment_attempt(record.id).await?;
        let attempts = record.times_attempted + 1;

        let payload = match record.payload_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                // A stored JSONB value that cannot be re-rendered is not
                // retryable; the attempt counter will walk it into the
                // permanently-failed state for operator inspection.
                tracing::warn!(
                    outbox_id = record.id,
                    event_type = %record.event_type,
                    error = %e,
                    "failed to render stored payload, skipping record"
                );
                metrics::counter!("outbox.publish_failures").increment(1);
                return Ok(());
            }
        };

        match self
            .bus
            .publish_raw(&record.topic, &record.event_type, &payload)
            .await
        {
            Ok(()) => {
                self.store.mark_published(record.id).await?;
                tracing::debug!(
                    outbox_id = record.id,
                    event_type = %record.event_type,
                    topic = %record.topic,
                    attempts,
                    "Outbox record published"
                );
                metrics::counter!("outbox.published", "event_type" => record.event_type.clone())
                    .increment(1);
            }
            Err(e) => {
                // Later records are still attempted; ordering is
                // best-effort and a stuck record must not starve the queue.
                if attempts >= self.config.max_retries {
                    tracing::error!(
                        outbox_id = record.id,
                        event_type = %record.event_type,
                        attempts,
                        error = %e,
                        "outbox record exhausted its publish attempts, operator attention required"
                    );
                    metrics::counter!("outbox.exhausted").increment(1);
                } else {
                    tracing::warn!(
                        outbox_id = record.id,
                        event_type = %record.event_type,
                        attempts,
                        error = %e,
                        "publish failed, will retry next cycle"
                    );
                }
                metrics::counter!("outbox.publish_failures").increment(1);
            }
        }

        Ok(())
    }

    /// One cleanup pass: delete a bounded batch of published records past
    /// the retention window.
    async fn cleanup_cycle(&self) -> Result<(), OutboxStoreError> {
        let cutoff = Utc::now() - self.config.retention;
        let deleted = self
            .store
            .delete_published(cutoff, self.config.delete_batch_size)
            .await?;

        if deleted > 0 {
            tracing::debug!(deleted, "Retention cleanup removed published records");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = PublisherConfig::default();
        assert!(config.batch_size > 0);
        assert!(config.max_retries > 0);
        assert!(config.retention > chrono::Duration::zero());
        assert!(config.cleanup_interval > config.poll_interval);
    }
}
