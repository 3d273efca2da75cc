//! Event bus transport abstraction over the message broker.
//!
//! This module provides the [`EventBus`] trait for publishing events to and
//! reading events from the broker. It is deliberately thin: typed dispatch
//! lives in [`crate::consumer`], durable staging in the outbox store. The
//! bus only moves envelopes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Business service │
//! └───────┬──────────┘
//!         │ tx: state change + outbox row
//!         ▼
//! ┌──────────────────┐      ┌─────────────────┐
//! │  Outbox table    │─────►│ OutboxPublisher │
//! └──────────────────┘ poll └────────┬────────┘
//!                                    │ publish_raw
//!                                    ▼
//!                           ┌─────────────────┐
//!                           │     Broker      │
//!                           └────────┬────────┘
//!                                    │ subscribe
//!                                    ▼
//!                           ┌─────────────────┐
//!                           │  EventConsumer  │
//!                           └─────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: events may be delivered multiple times;
//!   handlers must be idempotent.
//! - **Verbatim forwarding**: the outbox publisher sends the stored payload
//!   bytes unchanged via [`EventBus::publish_raw`], so what was written in
//!   the business transaction is exactly what reaches the broker.
//! - **Explicit acknowledgement**: delivered messages carry an [`AckToken`];
//!   the broker offset is committed only when the token fires, which the
//!   consumer does after dispatch by default.
//!
//! # Broker Message Format
//!
//! Message key = the event type string (UTF-8); message value = the JSON
//! payload matching the registered factory's expected shape for that type.

use crate::event::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker. The only error treated as fatal to
    /// service startup; steady-state errors are operational concerns.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// Network or transport error on an established connection.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// One-shot acknowledgement handle for a delivered message.
///
/// The transport commits the message's broker offset when the token fires.
/// Dropping the token without calling [`AckToken::ack`] leaves the offset
/// uncommitted, so the message is redelivered after a restart; that is the
/// at-least-once contract, never silent loss.
#[derive(Debug)]
pub struct AckToken {
    tx: Option<oneshot::Sender<()>>,
}

impl AckToken {
    /// Create a token and the receiver half the transport waits on.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Acknowledge the message, allowing the transport to commit its offset.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            // The transport side may already be gone during shutdown.
            let _ = tx.send(());
        }
    }
}

/// A single message read from the broker, not yet acknowledged.
#[derive(Debug)]
pub struct DeliveredMessage {
    /// Topic the message was read from.
    pub topic: String,

    /// Event type string, extracted from the broker message key.
    pub event_type: String,

    /// Raw payload bytes as carried on the wire.
    pub payload: Vec<u8>,

    /// Acknowledgement handle; fire it to commit the broker offset.
    pub ack: AckToken,
}

/// Stream of messages from a subscription.
///
/// Each item is either a [`DeliveredMessage`] or a transport-level error.
/// Per the subsystem contract, a transport error ends the read loop that
/// observes it; the caller decides whether to restart.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<DeliveredMessage, EventBusError>> + Send>>;

/// Trait for event bus transport implementations.
///
/// # Design Principles
///
/// - **Async-first**: all operations are async for non-blocking I/O.
/// - **Ordered within partition**: events with the same key (event type)
///   maintain broker order.
/// - **At-least-once**: subscribers may receive duplicate events and must
///   be idempotent.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage (`Arc<dyn EventBus>`); the
/// outbox publisher and the consumer both hold the bus behind a trait
/// object.
pub trait EventBus: Send + Sync {
    /// Publish pre-serialized payload bytes to a topic.
    ///
    /// Used by the outbox publisher to forward stored payloads verbatim and
    /// avoid double serialization. The message key is `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the
    /// message or the send times out. Callers in a background cycle retry
    /// on their next tick; synchronous callers surface the error.
    fn publish_raw<'a>(
        &'a self,
        topic: &'a str,
        event_type: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// Implementations use a consumer group so multiple instances of the
    /// same service share the workload.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the consumer cannot
    /// be created or the subscription is rejected.
    fn subscribe<'a>(
        &'a self,
        topics: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + 'a>>;

    /// Publish an envelope, serializing its payload.
    ///
    /// Used by business code for direct (non-outbox) publication. Delegates
    /// to [`EventBus::publish_raw`] with the envelope's topic and type
    /// string as the message key.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if payload serialization or
    /// the underlying send fails.
    fn publish<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = envelope
                .payload_bytes()
                .map_err(|e| EventBusError::PublishFailed {
                    topic: envelope.topic.clone(),
                    reason: e.to_string(),
                })?;
            self.publish_raw(&envelope.topic, &envelope.event_type, &payload)
                .await
        })
    }
}

/// Typed publishing helpers layered over [`EventBus`].
///
/// Blanket-implemented for every bus, including trait objects.
pub trait EventBusExt: EventBus {
    /// Serialize a concrete event into its envelope and publish it to the
    /// event's own topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if serialization or the
    /// underlying send fails.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// bus.publish_event(&CustomerCreated { customer_id: "abc".into() }).await?;
    /// ```
    fn publish_event<'a, E>(
        &'a self,
        event: &E,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>>
    where
        E: crate::event::Event + serde::Serialize,
    {
        let envelope = EventEnvelope::from_event(event);
        Box::pin(async move {
            let envelope = envelope.map_err(|e| EventBusError::PublishFailed {
                topic: E::TOPIC.to_string(),
                reason: e.to_string(),
            })?;
            self.publish(&envelope).await
        })
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}
