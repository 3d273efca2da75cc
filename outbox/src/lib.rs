//! Background outbox publisher for the eventmesh pipeline.
//!
//! This crate provides the [`OutboxPublisher`], the single periodic task
//! that drains a service's outbox table to the event bus with bounded
//! retries and retention cleanup. Pair it with a store implementation
//! (`eventmesh-postgres`) and a transport (`eventmesh-redpanda`).
//!
//! # Example
//!
//! ```ignore
//! use eventmesh_outbox::{OutboxPublisher, PublisherConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(PostgresOutboxStore::new(pool));
//! let bus = Arc::new(RedpandaEventBus::new("localhost:9092")?);
//!
//! let (publisher, shutdown) = OutboxPublisher::new(store, bus, PublisherConfig::default());
//! tokio::spawn(publisher.run());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod publisher;

pub use publisher::{OutboxPublisher, PublisherConfig};
