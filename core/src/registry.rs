//! Per-type event factories and typed handler registration.
//!
//! This module is the single source of truth mapping event type strings to
//! concrete Rust types. There is no global mutable registry: an
//! [`EventTypeRegistry`] is built explicitly at service startup, wrapped in
//! [`Subscriptions`] together with the handler lists, and passed by reference
//! into the consumer. After startup it is read-only, so dispatch needs no
//! synchronization.
//!
//! # Registration Model
//!
//! Each concrete event type contributes, at initialization time, a factory
//! `&[u8] -> Result<E, EventError>` keyed by its [`Event::EVENT_TYPE`]
//! string. Reconstruction erases the concrete type behind
//! `Arc<dyn Any + Send + Sync>`; handlers registered through
//! [`Subscriptions::on`] downcast back to the concrete type they were
//! registered with, so handler code never sees raw bytes.
//!
//! # Example
//!
//! ```
//! use eventmesh_core::registry::Subscriptions;
//! # use eventmesh_core::event::Event;
//! # use serde::{Serialize, Deserialize};
//! # #[derive(Clone, Debug, Serialize, Deserialize)]
//! # struct CustomerCreated { customer_id: String }
//! # impl Event for CustomerCreated {
//! #     const EVENT_TYPE: &'static str = "CustomerCreated";
//! #     const TOPIC: &'static str = "customer-events";
//! # }
//!
//! let subscriptions = Subscriptions::new()
//!     .on::<CustomerCreated, _, _>(|event| async move {
//!         println!("customer {} created", event.customer_id);
//!         Ok(())
//!     });
//!
//! assert_eq!(subscriptions.topics(), vec!["customer-events"]);
//! ```

use crate::event::{Event, EventError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A reconstructed event with its concrete type erased.
///
/// Produced by [`EventTypeRegistry::reconstruct`]; handlers downcast it back
/// to the type they were registered for. Shared behind an `Arc` so that
/// multiple handlers of the same message deserialize the payload only once.
pub type ReconstructedEvent = Arc<dyn Any + Send + Sync>;

/// Error type returned by event handlers.
///
/// Handler failures are logged by the dispatch loop and never retried by the
/// bus itself, so any error type is acceptable here.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<ReconstructedEvent, EventError> + Send + Sync>;

type HandlerFn =
    Arc<dyn Fn(ReconstructedEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

struct RegisteredType {
    topic: &'static str,
    decode: DecodeFn,
}

/// Maps event type strings to reconstruction factories.
///
/// Built once at startup and never mutated afterwards. Consulted by the
/// consumer path (mandatorily, to hand typed handlers a concrete value) and
/// available to the outbox publisher for optional validation before send.
#[derive(Default)]
pub struct EventTypeRegistry {
    types: HashMap<&'static str, RegisteredType>,
}

impl EventTypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for event type `E`.
    ///
    /// Registering the same type twice is a no-op (the factory for a given
    /// type string is always the same).
    pub fn register<E: Event + DeserializeOwned>(&mut self) {
        self.types.insert(
            E::EVENT_TYPE,
            RegisteredType {
                topic: E::TOPIC,
                decode: Arc::new(|bytes: &[u8]| {
                    let event = E::from_payload(bytes)?;
                    Ok(Arc::new(event) as ReconstructedEvent)
                }),
            },
        );
    }

    /// Reconstruct a concrete event from its type string and payload bytes.
    ///
    /// Reconstruction is pure: applying it twice to the same bytes yields
    /// equal values.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventType`] if no factory is registered
    /// for `event_type`, and [`EventError::MalformedPayload`] if the
    /// factory's own deserialization fails.
    pub fn reconstruct(
        &self,
        event_type: &str,
        payload: &[u8],
    ) -> Result<ReconstructedEvent, EventError> {
        let registered = self
            .types
            .get(event_type)
            .ok_or_else(|| EventError::UnknownEventType(event_type.to_string()))?;
        (registered.decode)(payload)
    }

    /// Whether a factory is registered for the given type string.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.types.contains_key(event_type)
    }

    /// The topic the given event type is carried on, if registered.
    #[must_use]
    pub fn topic_of(&self, event_type: &str) -> Option<&'static str> {
        self.types.get(event_type).map(|r| r.topic)
    }
}

/// Write-once handler registration for typed event consumption.
///
/// Maps each event type string to an ordered list of async handlers plus the
/// factory needed to reconstruct the concrete event. Built at service
/// startup with the [`Subscriptions::on`] builder; registering handlers
/// after consumption has started is unsupported (the consumer takes the
/// finished set behind an `Arc`, freezing it).
///
/// Multiple handlers may register for the same event type; the dispatch loop
/// invokes all of them for every delivered message of that type.
#[derive(Default)]
pub struct Subscriptions {
    registry: EventTypeRegistry,
    handlers: HashMap<&'static str, Vec<HandlerFn>>,
}

impl Subscriptions {
    /// Create an empty subscription set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for event type `E`.
    ///
    /// The factory for `E` is registered as a side effect, so the caller
    /// never wires factories and handlers separately and they cannot drift
    /// apart.
    ///
    /// # Examples
    ///
    /// ```
    /// # use eventmesh_core::registry::Subscriptions;
    /// # use eventmesh_core::event::Event;
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # struct OrderPlaced { order_id: String }
    /// # impl Event for OrderPlaced {
    /// #     const EVENT_TYPE: &'static str = "OrderPlaced";
    /// #     const TOPIC: &'static str = "order-events";
    /// # }
    /// let subscriptions = Subscriptions::new()
    ///     .on::<OrderPlaced, _, _>(|_event| async move {
    ///         // react to the order
    ///         Ok(())
    ///     })
    ///     .on::<OrderPlaced, _, _>(|_event| async move {
    ///         // a second, independent handler for the same type
    ///         Ok(())
    ///     });
    /// ```
    #[must_use]
    pub fn on<E, F, Fut>(mut self, handler: F) -> Self
    where
        E: Event + DeserializeOwned + Clone,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register::<E>();

        let erased: HandlerFn = Arc::new(move |event: ReconstructedEvent| {
            // Registration and reconstruction share the same type key, so
            // the downcast only fails on registry misuse.
            match event.downcast::<E>() {
                Ok(concrete) => Box::pin(handler((*concrete).clone())),
                Err(_) => Box::pin(async move {
                    Err(format!(
                        "reconstructed event does not downcast to {}",
                        E::EVENT_TYPE
                    )
                    .into())
                }) as BoxFuture<'static, Result<(), HandlerError>>,
            }
        });

        self.handlers.entry(E::EVENT_TYPE).or_default().push(erased);
        self
    }

    /// The registry backing this subscription set.
    #[must_use]
    pub const fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Handlers registered for the given event type, in registration order.
    ///
    /// Returns an empty slice for unregistered types; the consumer treats
    /// such messages as skippable, not as errors.
    #[must_use]
    pub fn handlers_for(&self, event_type: &str) -> &[HandlerFn] {
        self.handlers.get(event_type).map_or(&[], Vec::as_slice)
    }

    /// Distinct topics with at least one registered handler, sorted.
    ///
    /// The consumer starts one read loop per entry.
    #[must_use]
    pub fn topics(&self) -> Vec<&'static str> {
        let mut topics: Vec<&'static str> = self
            .handlers
            .keys()
            .filter_map(|event_type| self.registry.topic_of(event_type))
            .collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }

    /// Whether no handlers have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct CustomerCreated {
        customer_id: String,
    }

    impl Event for CustomerCreated {
        const EVENT_TYPE: &'static str = "CustomerCreated";
        const TOPIC: &'static str = "customer-events";
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Event for OrderPlaced {
        const EVENT_TYPE: &'static str = "OrderPlaced";
        const TOPIC: &'static str = "order-events";
    }

    fn registry_with_customer() -> EventTypeRegistry {
        let mut registry = EventTypeRegistry::new();
        registry.register::<CustomerCreated>();
        registry
    }

    #[test]
    fn reconstruct_yields_concrete_type() {
        let registry = registry_with_customer();
        let payload = br#"{"customer_id":"abc"}"#;

        let event = registry
            .reconstruct("CustomerCreated", payload)
            .expect("reconstruction should succeed");
        let concrete = event
            .downcast::<CustomerCreated>()
            .expect("downcast to registered type");

        assert_eq!(concrete.customer_id, "abc");
    }

    #[test]
    fn reconstruct_is_idempotent() {
        let registry = registry_with_customer();
        let payload = br#"{"customer_id":"abc"}"#;

        let first = registry
            .reconstruct("CustomerCreated", payload)
            .unwrap()
            .downcast::<CustomerCreated>()
            .unwrap();
        let second = registry
            .reconstruct("CustomerCreated", payload)
            .unwrap()
            .downcast::<CustomerCreated>()
            .unwrap();

        assert_eq!(*first, *second);
    }

    #[test]
    fn reconstruct_unknown_type() {
        let registry = registry_with_customer();

        let err = registry.reconstruct("LegacyEvent", b"{}").unwrap_err();

        assert!(matches!(err, EventError::UnknownEventType(ref t) if t == "LegacyEvent"));
    }

    #[test]
    fn reconstruct_malformed_payload() {
        let registry = registry_with_customer();

        let err = registry
            .reconstruct("CustomerCreated", b"not json")
            .unwrap_err();

        assert!(matches!(err, EventError::MalformedPayload { .. }));
    }

    #[test]
    fn topic_lookup() {
        let registry = registry_with_customer();

        assert_eq!(registry.topic_of("CustomerCreated"), Some("customer-events"));
        assert_eq!(registry.topic_of("LegacyEvent"), None);
        assert!(registry.contains("CustomerCreated"));
        assert!(!registry.contains("LegacyEvent"));
    }

    #[tokio::test]
    async fn multiple_handlers_for_one_type() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first_calls = Arc::clone(&calls);
        let second_calls = Arc::clone(&calls);

        let subscriptions = Subscriptions::new()
            .on::<CustomerCreated, _, _>(move |_event| {
                let calls = Arc::clone(&first_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on::<CustomerCreated, _, _>(move |_event| {
                let calls = Arc::clone(&second_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        let handlers = subscriptions.handlers_for("CustomerCreated");
        assert_eq!(handlers.len(), 2);

        let event = subscriptions
            .registry()
            .reconstruct("CustomerCreated", br#"{"customer_id":"abc"}"#)
            .unwrap();
        for handler in handlers {
            handler(Arc::clone(&event)).await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn topics_are_deduplicated_and_sorted() {
        let subscriptions = Subscriptions::new()
            .on::<OrderPlaced, _, _>(|_event| async move { Ok(()) })
            .on::<CustomerCreated, _, _>(|_event| async move { Ok(()) })
            .on::<CustomerCreated, _, _>(|_event| async move { Ok(()) });

        assert_eq!(
            subscriptions.topics(),
            vec!["customer-events", "order-events"]
        );
    }

    #[test]
    fn handlers_for_unregistered_type_is_empty() {
        let subscriptions = Subscriptions::new();
        assert!(subscriptions.handlers_for("LegacyEvent").is_empty());
        assert!(subscriptions.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn reconstruction_is_idempotent_for_any_payload(customer_id in ".*") {
            let registry = registry_with_customer();
            let payload =
                serde_json::to_vec(&serde_json::json!({ "customer_id": customer_id })).unwrap();

            let first = registry
                .reconstruct("CustomerCreated", &payload)
                .unwrap()
                .downcast::<CustomerCreated>()
                .unwrap();
            let second = registry
                .reconstruct("CustomerCreated", &payload)
                .unwrap()
                .downcast::<CustomerCreated>()
                .unwrap();

            proptest::prop_assert_eq!(&*first, &*second);
        }
    }
}
