//! In-memory outbox store for tests.

use chrono::{DateTime, Utc};
use eventmesh_core::outbox::{OutboxRecord, OutboxStore, OutboxStoreError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// In-memory [`OutboxStore`] implementation for publisher tests.
///
/// Backed by a `Mutex<Vec<OutboxRecord>>`; ids are assigned monotonically
/// in seed order, mirroring a `BIGSERIAL` column. Supports scripted fetch
/// failures so tests can exercise the publisher's abort-and-retry path.
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
    next_id: AtomicI64,
    fetch_failures_remaining: AtomicUsize,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fetch_failures_remaining: AtomicUsize::new(0),
        }
    }

    /// Seed a pending record, returning its id.
    pub fn seed(&self, event_type: &str, topic: &str, payload: serde_json::Value) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OutboxRecord {
                id,
                event_type: event_type.to_string(),
                topic: topic.to_string(),
                payload,
                created_at: Utc::now(),
                times_attempted: 0,
                published_at: None,
            });
        id
    }

    /// Make the next `n` calls to `fetch_pending` fail with a database
    /// error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fetch_failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every record, in id order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        records.sort_by_key(|r| r.id);
        records
    }

    /// The record with the given id, if present.
    #[must_use]
    pub fn record(&self, id: i64) -> Option<OutboxRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn fetch_pending(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let failed = self
                .fetch_failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(OutboxStoreError::Database("scripted failure".to_string()));
            }

            let mut pending: Vec<OutboxRecord> = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.published_at.is_none() && r.times_attempted < max_attempts)
                .cloned()
                .collect();
            pending.sort_by_key(|r| r.id);
            pending.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(pending)
        })
    }

    fn mark_published(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                if record.published_at.is_none() {
                    record.published_at = Some(Utc::now());
                }
            }
            Ok(())
        })
    }

    fn increment_attempt(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.times_attempted += 1;
            }
            Ok(())
        })
    }

    fn delete_published(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let mut deletable: Vec<i64> = records
                .iter()
                .filter(|r| r.published_at.is_some_and(|at| at < older_than))
                .map(|r| r.id)
                .collect();
            deletable.sort_unstable();
            deletable.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

            let before = records.len();
            records.retain(|r| !deletable.contains(&r.id));
            Ok((before - records.len()) as u64)
        })
    }

    fn fetch_failed(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut failed: Vec<OutboxRecord> = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.published_at.is_none() && r.times_attempted >= max_attempts)
                .cloned()
                .collect();
            failed.sort_by_key(|r| r.id);
            failed.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(failed)
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxStoreError>> + Send + '_>> {
        Box::pin(async move {
            let count = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.published_at.is_none())
                .count();
            Ok(i64::try_from(count).unwrap_or(i64::MAX))
        })
    }
}
