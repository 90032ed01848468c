//! tokio-postgres backend with a fixed-size FIFO connection pool.
//!
//! Connections are opened lazily up to the pool size and parked between
//! uses. Each checked-out connection keeps the driver's [`CancelToken`] so
//! an interrupted run can cancel the statement server-side.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_postgres::{CancelToken, Client, NoTls};
use tracing::warn;

use crate::db::{Database, DbConn};
use crate::error::{Error, Result};

pub struct PostgresPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    dsn: String,
    // Semaphore waiters are FIFO, which is exactly the acquisition order we
    // promise.
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledClient>>,
}

struct PooledClient {
    client: Client,
    cancel: CancelToken,
    connection: JoinHandle<()>,
}

impl PostgresPool {
    pub fn new(dsn: impl Into<String>, size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dsn: dsn.into(),
                permits: Arc::new(Semaphore::new(size.max(1))),
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    async fn connect(dsn: &str) -> Result<PooledClient> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let cancel = client.cancel_token();
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection terminated");
            }
        });
        Ok(PooledClient {
            client,
            cancel,
            connection,
        })
    }
}

#[async_trait]
impl Database for PostgresPool {
    async fn acquire(&self) -> Result<Box<dyn DbConn>> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Database("connection pool is closed".to_string()))?;

        let parked = self.inner.idle.lock().pop_front();
        let slot = match parked {
            Some(slot) if !slot.client.is_closed() => slot,
            other => {
                if let Some(broken) = other {
                    broken.connection.abort();
                }
                PostgresPool::connect(&self.inner.dsn).await?
            }
        };

        Ok(Box::new(PostgresConn {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }))
    }
}

pub struct PostgresConn {
    slot: Option<PooledClient>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PostgresConn {
    fn client(&self) -> &Client {
        &self
            .slot
            .as_ref()
            .expect("connection present until drop")
            .client
    }
}

#[async_trait]
impl DbConn for PostgresConn {
    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.client()
            .batch_execute(sql)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn fetch_count(&mut self, sql: &str) -> Result<i64> {
        let row = self
            .client()
            .query_one(sql, &[])
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        row.try_get(0).map_err(|e| Error::Database(e.to_string()))
    }

    async fn cancel(&self) -> Result<()> {
        if let Some(slot) = &self.slot {
            slot.cancel
                .clone()
                .cancel_query(NoTls)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for PostgresConn {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.client.is_closed() {
                slot.connection.abort();
            } else {
                self.pool.idle.lock().push_back(slot);
            }
        }
    }
}
