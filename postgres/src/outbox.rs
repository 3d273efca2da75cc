//! `PostgreSQL` outbox store.
//!
//! Provides durable, transactional staging of events awaiting publication.
//! Rows are written by [`PostgresOutboxStore::enqueue`] inside the calling
//! service's own transaction and drained asynchronously by the outbox
//! publisher through the [`OutboxStore`] trait.

use chrono::{DateTime, Utc};
use eventmesh_core::event::EventEnvelope;
use eventmesh_core::outbox::{OutboxRecord, OutboxStore, OutboxStoreError};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed outbox store.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE outbox_events (
///     id BIGSERIAL PRIMARY KEY,
///     event_type TEXT NOT NULL,
///     topic TEXT NOT NULL,
///     event_payload JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     times_attempted INTEGER NOT NULL DEFAULT 0,
///     published_at TIMESTAMPTZ
/// );
///
/// -- Accelerates FetchPending; only unpublished rows are indexed.
/// CREATE INDEX idx_outbox_events_pending
///     ON outbox_events (id) WHERE published_at IS NULL;
/// ```
///
/// # Transactionality
///
/// `enqueue` takes the caller's open transaction: the event row becomes
/// visible to the publisher only when the business mutation commits, and
/// disappears with it on rollback. It performs no network I/O.
///
/// # Example
///
/// ```no_run
/// use eventmesh_postgres::PostgresOutboxStore;
/// use eventmesh_core::event::EventEnvelope;
///
/// # async fn example(pool: sqlx::PgPool, envelope: EventEnvelope) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresOutboxStore::new(pool.clone());
///
/// let mut tx = pool.begin().await?;
/// // ... business-state mutation on `tx` ...
/// store.enqueue(&mut tx, &envelope).await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new outbox store with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stage an envelope for publication inside the caller's transaction.
    ///
    /// Returns the id of the created outbox row.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Database`] if the insert fails
    /// (connection, constraint violation). Never performs network I/O
    /// toward the broker.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<i64, OutboxStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO outbox_events (event_type, topic, event_payload)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(&envelope.event_type)
        .bind(&envelope.topic)
        .bind(&envelope.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

        tracing::debug!(
            outbox_id = id,
            event_type = %envelope.event_type,
            topic = %envelope.topic,
            "Event staged in outbox"
        );

        metrics::counter!("outbox.enqueued", "event_type" => envelope.event_type.clone())
            .increment(1);

        Ok(id)
    }

    /// Convert a database row to an [`OutboxRecord`].
    fn row_to_record(row: &sqlx::postgres::PgRow) -> OutboxRecord {
        OutboxRecord {
            id: row.get("id"),
            event_type: row.get("event_type"),
            topic: row.get("topic"),
            payload: row.get("event_payload"),
            created_at: row.get("created_at"),
            times_attempted: row.get("times_attempted"),
            published_at: row.get("published_at"),
        }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn fetch_pending(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, event_type, topic, event_payload,
                       created_at, times_attempted, published_at
                FROM outbox_events
                WHERE published_at IS NULL AND times_attempted < $1
                ORDER BY id ASC
                LIMIT $2
                ",
            )
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_record).collect())
        })
    }

    fn mark_published(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            // The IS NULL guard keeps the first publication timestamp on
            // duplicate calls.
            sqlx::query(
                r"
                UPDATE outbox_events
                SET published_at = NOW()
                WHERE id = $1 AND published_at IS NULL
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            tracing::debug!(outbox_id = id, "Outbox record marked published");

            Ok(())
        })
    }

    fn increment_attempt(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE outbox_events
                SET times_attempted = times_attempted + 1
                WHERE id = $1
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            Ok(())
        })
    }

    fn delete_published(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            // Batched through the id subquery to bound lock duration; the
            // published_at predicate guarantees pending rows are untouchable
            // regardless of age.
            let result = sqlx::query(
                r"
                DELETE FROM outbox_events
                WHERE id IN (
                    SELECT id FROM outbox_events
                    WHERE published_at IS NOT NULL AND published_at < $1
                    ORDER BY id ASC
                    LIMIT $2
                )
                ",
            )
            .bind(older_than)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            let deleted = result.rows_affected();
            if deleted > 0 {
                tracing::info!(deleted, "Published outbox records cleaned up");
                metrics::counter!("outbox.deleted").increment(deleted);
            }

            Ok(deleted)
        })
    }

    fn fetch_failed(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, event_type, topic, event_payload,
                       created_at, times_attempted, published_at
                FROM outbox_events
                WHERE published_at IS NULL AND times_attempted >= $1
                ORDER BY id ASC
                LIMIT $2
                ",
            )
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_record).collect())
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM outbox_events
                WHERE published_at IS NULL
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxStoreError::Database(e.to_string()))?;

            Ok(count)
        })
    }
}
