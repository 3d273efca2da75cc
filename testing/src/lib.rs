//! # Eventmesh Testing
//!
//! Testing utilities and in-memory fakes for the eventmesh pipeline.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: records publishes, scripts transient broker
//!   failures, and feeds subscribed streams from the test side.
//! - [`InMemoryOutboxStore`]: a `Vec`-backed outbox with monotonic ids and
//!   scriptable fetch failures.
//!
//! Both implement the corresponding `eventmesh-core` traits, so the outbox
//! publisher and the event consumer can be exercised end to end without
//! Docker, Postgres, or a broker.
//!
//! ## Example
//!
//! ```ignore
//! use eventmesh_testing::{InMemoryEventBus, InMemoryOutboxStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let bus = Arc::new(InMemoryEventBus::new());
//! store.seed("CustomerCreated", "customer-events", serde_json::json!({"id": "abc"}));
//!
//! let (publisher, shutdown) = OutboxPublisher::new(store.clone(), bus.clone(), config);
//! // drive the publisher, then assert on bus.published()
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod store;

pub use bus::{InMemoryEventBus, PublishedMessage};
pub use store::InMemoryOutboxStore;
