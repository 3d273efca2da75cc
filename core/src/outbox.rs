//! Outbox record type and the publisher-facing store abstraction.
//!
//! The outbox pattern writes an event row in the same database transaction
//! as the business-state change it describes, then publishes it
//! asynchronously. This avoids the dual-write problem between the database
//! and the broker: either both the mutation and the event commit, or
//! neither does.
//!
//! This module defines the persisted record shape and the [`OutboxStore`]
//! trait the background publisher drives. Enqueueing is intentionally NOT
//! part of the trait: it must run inside the caller's open database
//! transaction, so it is a concrete method on the storage implementation
//! (see `eventmesh-postgres`), bound to that backend's transaction type.
//!
//! # Record Lifecycle
//!
//! Created in the business transaction → fetched in batches by the
//! publisher, oldest first → attempt counter incremented, then
//! `published_at` set on success → deleted by retention cleanup after a
//! grace window. A record that exhausts its attempts stays unpublished and
//! is surfaced through [`OutboxStore::fetch_failed`] for operator
//! attention; it is never deleted automatically.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::event::EventError;

/// Errors from outbox storage operations.
///
/// Store errors during a publisher cycle abort the cycle early; the cycle
/// retries on its next tick. They are never fatal to the process.
#[derive(Error, Debug)]
pub enum OutboxStoreError {
    /// Database failure (connection, constraint, query).
    #[error("Database error: {0}")]
    Database(String),

    /// Payload (de)serialization failure at the storage boundary.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<EventError> for OutboxStoreError {
    fn from(err: EventError) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Persisted representation of a pending or attempted publication.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Monotonically increasing identifier; the total order for FIFO
    /// publication within one service.
    pub id: i64,

    /// Event type string, copied from the envelope.
    pub event_type: String,

    /// Destination topic, copied from the envelope.
    pub topic: String,

    /// JSON payload, copied from the envelope. Forwarded verbatim.
    pub payload: serde_json::Value,

    /// Creation timestamp; immutable.
    pub created_at: DateTime<Utc>,

    /// Number of publish attempts so far, successful or not.
    pub times_attempted: i32,

    /// Set when the record was successfully handed to the broker; `None`
    /// means still pending. A published record is never mutated again
    /// except by retention deletion.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Serialize the stored payload to the exact bytes sent to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Serialization`] if the stored value
    /// cannot be rendered to JSON text.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, OutboxStoreError> {
        serde_json::to_vec(&self.payload).map_err(|e| OutboxStoreError::Serialization(e.to_string()))
    }

    /// Whether this record has exhausted its publish attempts.
    #[must_use]
    pub const fn is_exhausted(&self, max_attempts: i32) -> bool {
        self.published_at.is_none() && self.times_attempted >= max_attempts
    }
}

/// Durable staging of events awaiting publication, as seen by the
/// background publisher.
///
/// Implementations must order pending records by `id` ascending so the
/// publisher approximates the service's global event order, and must never
/// let retention cleanup touch unpublished rows.
///
/// # Concurrency
///
/// One publisher instance per service is the deployment contract.
/// `mark_published` is idempotent, so an accidental second instance only
/// produces duplicate publishes, which the at-least-once contract already
/// requires consumers to tolerate.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns so the publisher can hold the
/// store as `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Fetch up to `limit` pending records with fewer than `max_attempts`
    /// attempts, oldest first.
    ///
    /// Records at or over the attempt cap are deliberately excluded: the
    /// publisher stops attempting them and operators inspect them through
    /// [`OutboxStore::fetch_failed`].
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on query failure.
    fn fetch_pending(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>;

    /// Set `published_at` to now. Idempotent: a record already published
    /// keeps its original timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on update failure.
    fn mark_published(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>>;

    /// Increment `times_attempted`, independent of the publish outcome.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on update failure.
    fn increment_attempt(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>>;

    /// Bulk-delete published records older than `older_than`, at most
    /// `limit` rows per call to bound lock duration. Returns the count
    /// deleted. Never deletes a record with `published_at IS NULL`,
    /// regardless of age.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on delete failure.
    fn delete_published(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxStoreError>> + Send + '_>>;

    /// Fetch records that exhausted their attempts without publishing, for
    /// operator inspection and alerting.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on query failure.
    fn fetch_failed(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>;

    /// Count of records still awaiting publication. Useful for health
    /// checks and queue-depth monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] on query failure.
    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxStoreError>> + Send + '_>>;
}
