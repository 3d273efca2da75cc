//! # Eventmesh Core
//!
//! Core traits and types for the eventmesh outbox / event-bus pipeline.
//!
//! Business services mutate local state and must reliably notify other
//! services of that mutation through a shared broker. This crate defines
//! the pieces that make that reliable:
//!
//! - [`event`]: the [`Event`](event::Event) trait and the
//!   [`EventEnvelope`](event::EventEnvelope) wire/storage wrapper.
//! - [`registry`]: per-type factories and typed handler registration, built
//!   once at startup with no global mutable state.
//! - [`outbox`]: the persisted [`OutboxRecord`](outbox::OutboxRecord) and
//!   the [`OutboxStore`](outbox::OutboxStore) trait the background
//!   publisher drives.
//! - [`bus`]: the [`EventBus`](bus::EventBus) transport trait over the
//!   broker.
//! - [`consumer`]: the [`EventConsumer`](consumer::EventConsumer) dispatch
//!   loop with per-topic reads and a bounded worker pool.
//!
//! # Delivery Semantics
//!
//! The pipeline provides at-least-once delivery: an event written in a
//! committed business transaction is eventually published (given a broker
//! that eventually accepts writes), and consumers may observe duplicates,
//! which their handlers must tolerate. Ordering within one service is
//! best-effort in ascending outbox id order; a permanently failing record
//! does not block later records.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod consumer;
pub mod event;
pub mod outbox;
pub mod registry;

pub use bus::{AckToken, DeliveredMessage, EventBus, EventBusError, EventBusExt, MessageStream};
pub use consumer::{AckPolicy, ConsumerConfig, EventConsumer};
pub use event::{Event, EventEnvelope, EventError};
pub use outbox::{OutboxRecord, OutboxStore, OutboxStoreError};
pub use registry::{EventTypeRegistry, HandlerError, ReconstructedEvent, Subscriptions};
