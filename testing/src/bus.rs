//! In-memory event bus for tests.

use eventmesh_core::bus::{AckToken, DeliveredMessage, EventBus, EventBusError, MessageStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

/// A message captured by [`InMemoryEventBus::publish_raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Message key (the event type string).
    pub event_type: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

type DeliveryItem = Result<DeliveredMessage, EventBusError>;

/// In-memory [`EventBus`] implementation for fast, deterministic tests.
///
/// Records every published message for assertions, supports scripted
/// transient publish failures for retry tests, and lets the test side feed
/// messages to subscribers with full control over acknowledgement
/// observation.
///
/// # Example
///
/// ```
/// use eventmesh_testing::InMemoryEventBus;
/// use eventmesh_core::bus::EventBus;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let bus = InMemoryEventBus::new();
///
/// bus.publish_raw("customer-events", "CustomerCreated", b"{}")
///     .await
///     .unwrap();
///
/// let published = bus.published();
/// assert_eq!(published.len(), 1);
/// assert_eq!(published[0].event_type, "CustomerCreated");
/// # }
/// ```
#[derive(Default)]
pub struct InMemoryEventBus {
    published: Mutex<Vec<PublishedMessage>>,
    failures_remaining: AtomicUsize,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<DeliveryItem>>>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message published so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the next `n` calls to `publish_raw` fail with
    /// [`EventBusError::PublishFailed`], simulating a broker outage that
    /// later recovers.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Deliver a message to every subscriber of `topic`.
    ///
    /// Returns one ack receiver per delivered copy so tests can assert
    /// whether and when consumers acknowledged.
    pub fn deliver(
        &self,
        topic: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Vec<oneshot::Receiver<()>> {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut ack_receivers = Vec::new();
        if let Some(senders) = subscribers.get(topic) {
            for sender in senders {
                let (ack, ack_rx) = AckToken::channel();
                let message = DeliveredMessage {
                    topic: topic.to_string(),
                    event_type: event_type.to_string(),
                    payload: payload.to_vec(),
                    ack,
                };
                if sender.send(Ok(message)).is_ok() {
                    ack_receivers.push(ack_rx);
                }
            }
        }
        ack_receivers
    }

    /// Emit a transport-level error to every subscriber of `topic`.
    pub fn emit_error(&self, topic: &str, error: EventBusError) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(senders) = subscribers.get(topic) {
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    /// Number of active subscriptions for `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish_raw<'a>(
        &'a self,
        topic: &'a str,
        event_type: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let failed = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }

            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PublishedMessage {
                    topic: topic.to_string(),
                    event_type: event_type.to_string(),
                    payload: payload.to_vec(),
                });
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topics: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();

            {
                let mut subscribers = self
                    .subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for topic in topics {
                    subscribers
                        .entry((*topic).to_string())
                        .or_default()
                        .push(tx.clone());
                }
            }

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
