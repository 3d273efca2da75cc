//! Typed event consumption with per-topic read loops and a bounded worker
//! pool.
//!
//! # Overview
//!
//! The [`EventConsumer`] drives the receiving side of the pipeline:
//! - starts one independent read loop per topic that has at least one
//!   registered handler,
//! - reconstructs each message's concrete event through the type registry,
//! - dispatches every registered handler for that type into a bounded
//!   worker pool,
//! - acknowledges the message so the transport can commit its offset.
//!
//! # Backpressure
//!
//! Handler invocations run in a worker pool bounded by a semaphore, not as
//! unbounded per-message tasks: a slow handler eventually blocks the read
//! loop from dispatching more work, which in turn stops the loop from
//! pulling further messages. The pool size is configuration.
//!
//! # Acknowledgement
//!
//! With the default [`AckPolicy::AfterDispatch`], a message is acknowledged
//! only after all of its handlers have been handed to the pool, so a crash
//! before that point leads to redelivery rather than silent loss.
//! [`AckPolicy::BeforeDispatch`] trades that guarantee for throughput.
//!
//! # Failure Isolation
//!
//! A message with an unregistered type is acknowledged and skipped. A
//! payload that fails reconstruction is logged with its type and raw size,
//! then acknowledged and skipped. A handler error is logged and never
//! retried by the bus. None of these stop the read loop; only
//! transport-level errors do, and those end [`EventConsumer::run`] so the
//! caller can decide whether to restart.

use crate::bus::{DeliveredMessage, EventBus, EventBusError};
use crate::registry::Subscriptions;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

/// When the broker offset for a message is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Commit after all handlers for the message have been dispatched to
    /// the worker pool. The at-least-once default.
    #[default]
    AfterDispatch,

    /// Commit as soon as the message is received, before dispatch. Higher
    /// throughput, but a crash between commit and dispatch loses the
    /// message for this consumer group.
    BeforeDispatch,
}

/// Configuration for the consumer's dispatch behavior.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum number of concurrently running handler invocations per
    /// topic read loop.
    pub worker_pool_size: usize,

    /// Offset commit timing.
    pub ack_policy: AckPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 16,
            ack_policy: AckPolicy::AfterDispatch,
        }
    }
}

/// Drives typed event dispatch from the bus to registered handlers.
///
/// # Example
///
/// ```ignore
/// let subscriptions = Subscriptions::new()
///     .on::<CustomerCreated, _, _>(|event| async move { /* ... */ Ok(()) });
///
/// let (consumer, shutdown) = EventConsumer::new(
///     bus,
///     Arc::new(subscriptions),
///     ConsumerConfig::default(),
/// );
///
/// // In a signal handler:
/// // shutdown.send(true).ok();
///
/// consumer.run().await?;
/// ```
pub struct EventConsumer {
    bus: Arc<dyn EventBus>,
    subscriptions: Arc<Subscriptions>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl EventConsumer {
    /// Create a new consumer over the given bus and subscription set.
    ///
    /// Returns the consumer and a shutdown sender. Send `true` to stop all
    /// read loops promptly; in-flight handler invocations complete, no new
    /// work is admitted.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        subscriptions: Arc<Subscriptions>,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            bus,
            subscriptions,
            config,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Start one read loop per subscribed topic and run until shutdown or a
    /// transport-level error.
    ///
    /// # Errors
    ///
    /// Returns the first [`EventBusError`] reported by any topic's read
    /// loop (subscription failure or transport error mid-stream). The
    /// caller decides whether to restart.
    pub async fn run(self) -> Result<(), EventBusError> {
        let topics = self.subscriptions.topics();
        if topics.is_empty() {
            tracing::warn!("no handlers registered, consumer has nothing to do");
            return Ok(());
        }

        tracing::info!(
            topics = ?topics,
            worker_pool_size = self.config.worker_pool_size,
            ack_policy = ?self.config.ack_policy,
            "Starting event consumer"
        );

        let mut loops = JoinSet::new();
        for topic in topics {
            let bus = Arc::clone(&self.bus);
            let subscriptions = Arc::clone(&self.subscriptions);
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            loops.spawn(topic_loop(bus, subscriptions, config, shutdown, topic));
        }

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // One failing loop ends consumption; dropping the set
                    // aborts the sibling loops. Handlers already dispatched
                    // run to completion on their own tasks.
                    tracing::error!(error = %e, "topic read loop failed, stopping consumer");
                    return Err(e);
                }
                Err(join_err) => {
                    return Err(EventBusError::TransportError(format!(
                        "topic read loop aborted: {join_err}"
                    )));
                }
            }
        }

        tracing::info!("Event consumer stopped");
        Ok(())
    }
}

async fn topic_loop(
    bus: Arc<dyn EventBus>,
    subscriptions: Arc<Subscriptions>,
    config: ConsumerConfig,
    mut shutdown: watch::Receiver<bool>,
    topic: &'static str,
) -> Result<(), EventBusError> {
    let topics = [topic];
    let mut stream = bus.subscribe(&topics).await?;
    let pool = Arc::new(Semaphore::new(config.worker_pool_size));

    tracing::info!(topic, "Topic read loop started");

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(message)) => {
                    dispatch_message(&subscriptions, &pool, config.ack_policy, message).await;
                }
                Some(Err(e)) => {
                    tracing::error!(topic, error = %e, "transport error on topic read loop");
                    drain_pool(&pool, config.worker_pool_size).await;
                    return Err(e);
                }
                None => {
                    drain_pool(&pool, config.worker_pool_size).await;
                    return Err(EventBusError::TransportError(format!(
                        "message stream for topic '{topic}' ended unexpectedly"
                    )));
                }
            },
            changed = shutdown.changed() => {
                // A dropped sender counts as a shutdown signal.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(topic, "Shutdown signal received, draining handlers");
                    drain_pool(&pool, config.worker_pool_size).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Reconstruct one message and hand every registered handler to the pool.
///
/// Does not return until all handlers are dispatched, so the read loop
/// cannot advance to the next message early; this is what bounds per-topic
/// concurrency and preserves backpressure.
async fn dispatch_message(
    subscriptions: &Subscriptions,
    pool: &Arc<Semaphore>,
    ack_policy: AckPolicy,
    message: DeliveredMessage,
) {
    let DeliveredMessage {
        topic,
        event_type,
        payload,
        ack,
    } = message;

    let handlers = subscriptions.handlers_for(&event_type);
    if handlers.is_empty() {
        tracing::debug!(
            topic = %topic,
            event_type = %event_type,
            "no handler registered for event type, skipping"
        );
        metrics::counter!("event_bus.consumer.skipped", "reason" => "unregistered").increment(1);
        ack.ack();
        return;
    }

    let event = match subscriptions.registry().reconstruct(&event_type, &payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                topic = %topic,
                event_type = %event_type,
                payload_size = payload.len(),
                error = %e,
                "failed to reconstruct event, skipping message"
            );
            metrics::counter!("event_bus.consumer.skipped", "reason" => "malformed").increment(1);
            ack.ack();
            return;
        }
    };

    let deferred_ack = match ack_policy {
        AckPolicy::BeforeDispatch => {
            ack.ack();
            None
        }
        AckPolicy::AfterDispatch => Some(ack),
    };

    for handler in handlers {
        let Ok(permit) = Arc::clone(pool).acquire_owned().await else {
            // The pool semaphore is never closed while the loop runs.
            tracing::error!(event_type = %event_type, "worker pool closed mid-dispatch");
            break;
        };

        let handler = Arc::clone(handler);
        let event = Arc::clone(&event);
        let event_type = event_type.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler(event).await {
                // Handler failures are logged, never retried by the bus.
                tracing::error!(
                    event_type = %event_type,
                    error = %e,
                    "event handler failed"
                );
                metrics::counter!("event_bus.consumer.handler_failures").increment(1);
            }
        });
    }

    if let Some(ack) = deferred_ack {
        ack.ack();
    }
    metrics::counter!("event_bus.consumer.dispatched").increment(1);
}

/// Wait until every handler task has released its permit.
async fn drain_pool(pool: &Arc<Semaphore>, pool_size: usize) {
    let permits = u32::try_from(pool_size).unwrap_or(u32::MAX);
    let _ = pool.acquire_many(permits).await;
}
