//! Database seam: the scheduler talks to a [`Database`] that hands out
//! connections, never to a driver directly. The real backend is Postgres;
//! tests script a [`mock::MockDatabase`] against the same traits.

pub mod mock;
pub mod postgres;

pub use mock::MockDatabase;
pub use postgres::PostgresPool;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Database: Send + Sync {
    /// Acquires one pooled connection. Acquisition is FIFO and bounded by
    /// the pool size; callers may be parked here under load.
    async fn acquire(&self) -> Result<Box<dyn DbConn>>;
}

#[async_trait]
pub trait DbConn: Send {
    /// Runs a script of one or more statements to completion.
    async fn batch_execute(&mut self, sql: &str) -> Result<()>;

    /// Runs a query returning a single row with a single integer column.
    async fn fetch_count(&mut self, sql: &str) -> Result<i64>;

    /// Asks the server to cancel whatever this connection is running.
    async fn cancel(&self) -> Result<()>;
}
