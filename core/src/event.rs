//! Event trait and envelope types for the outbox / event-bus pipeline.
//!
//! This module defines the wire representation of a domain event. Events are
//! facts about a completed business mutation and are immutable once created.
//!
//! # Design
//!
//! Events are serialized as JSON. The envelope stores the payload as a
//! [`serde_json::Value`] so that the outbox table can persist it in a `JSONB`
//! column and the publisher can forward the stored bytes verbatim, without a
//! deserialize/re-serialize round trip that could drift from what the
//! producing transaction wrote.
//!
//! The type string and the destination topic are associated constants of the
//! concrete event type: they are available without an instance, which is what
//! lets the registry map `event_type` strings to factories at startup.
//!
//! # Example
//!
//! ```
//! use eventmesh_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct CustomerCreated {
//!     customer_id: String,
//! }
//!
//! impl Event for CustomerCreated {
//!     const EVENT_TYPE: &'static str = "CustomerCreated";
//!     const TOPIC: &'static str = "customer-events";
//! }
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event (de)serialization and reconstruction.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an event to its JSON payload.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// A payload could not be deserialized into its registered concrete type.
    #[error("Malformed payload for event type '{event_type}' ({payload_size} bytes): {reason}")]
    MalformedPayload {
        /// The event type the payload claimed to be.
        event_type: String,
        /// Size of the raw payload in bytes.
        payload_size: usize,
        /// The underlying deserialization failure.
        reason: String,
    },

    /// No factory is registered for the given event type string.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A domain event that can be staged in the outbox and carried on the bus.
///
/// Events represent immutable facts about things that have happened. The
/// type string is the stable wire identifier used for broker message keys,
/// handler dispatch, and factory lookup; it must never change for a given
/// payload shape.
///
/// # Topic Naming Convention
///
/// Topics follow the pattern `{aggregate}-events`:
/// - `customer-events` - all events from the customer service
/// - `order-events` - all events from the order service
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` so they can be shared across the
/// dispatch worker pool.
pub trait Event: Send + Sync + 'static {
    /// Stable wire identifier for this event type (e.g. `"CustomerCreated"`).
    const EVENT_TYPE: &'static str;

    /// Topic this event is published on and consumed from.
    const TOPIC: &'static str;

    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    /// Returns the topic this event belongs to.
    fn topic(&self) -> &'static str {
        Self::TOPIC
    }

    /// Serialize this event to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the event cannot be
    /// represented as JSON (e.g. a map with non-string keys).
    fn to_payload(&self) -> Result<serde_json::Value, EventError>
    where
        Self: Serialize,
    {
        serde_json::to_value(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Deserialize an event from raw JSON payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedPayload`] if the bytes are not valid
    /// JSON for this type, carrying the type string and raw size for
    /// diagnostics.
    fn from_payload(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        serde_json::from_slice(bytes).map_err(|e| EventError::MalformedPayload {
            event_type: Self::EVENT_TYPE.to_string(),
            payload_size: bytes.len(),
            reason: e.to_string(),
        })
    }
}

/// The wire and storage wrapper around a domain event.
///
/// An envelope carries everything the pipeline needs without knowing the
/// concrete type: the type string (broker message key and registry lookup
/// key), the destination topic, and the JSON payload. It is what
/// `OutboxStore::enqueue` persists and what `EventBus::publish` sends.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    /// The event type identifier (e.g. `"CustomerCreated"`).
    pub event_type: String,

    /// Destination/source topic name.
    pub topic: String,

    /// JSON representation of the concrete event's fields.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Create a new envelope from its parts.
    #[must_use]
    pub const fn new(event_type: String, topic: String, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            topic,
            payload,
        }
    }

    /// Create an envelope from a concrete event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the event cannot be
    /// serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventmesh_core::event::{Event, EventEnvelope};
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # struct CustomerCreated { customer_id: String }
    /// # impl Event for CustomerCreated {
    /// #     const EVENT_TYPE: &'static str = "CustomerCreated";
    /// #     const TOPIC: &'static str = "customer-events";
    /// # }
    ///
    /// let event = CustomerCreated { customer_id: "abc".to_string() };
    /// let envelope = EventEnvelope::from_event(&event).unwrap();
    /// assert_eq!(envelope.event_type, "CustomerCreated");
    /// assert_eq!(envelope.topic, "customer-events");
    /// ```
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            topic: event.topic().to_string(),
            payload: event.to_payload()?,
        })
    }

    /// Serialize the payload to the exact bytes carried on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload value cannot be
    /// rendered to JSON text.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(&self.payload).map_err(|e| EventError::Serialization(e.to_string()))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ type: {}, topic: {} }}",
            self.event_type, self.topic
        )
    }
}
