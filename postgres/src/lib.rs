//! `PostgreSQL` outbox store for the eventmesh pipeline.
//!
//! This crate provides the durable staging half of the outbox pattern:
//! business services write event rows inside their own transactions via
//! [`PostgresOutboxStore::enqueue`], and the background publisher drains
//! them through the `OutboxStore` trait from `eventmesh-core`.
//!
//! Uses sqlx with runtime-bound queries and a shared connection pool.
//!
//! # Example
//!
//! ```no_run
//! use eventmesh_postgres::PostgresOutboxStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/customers").await?;
//! let store = PostgresOutboxStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;

pub use outbox::PostgresOutboxStore;
