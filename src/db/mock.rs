//! Scripted in-memory backend for exercising the scheduler without a
//! server. Records every statement in dispatch order; failures and count
//! results are keyed by SQL substring.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::{Database, DbConn};
use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct MockDatabase {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    executed: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
    counts: Mutex<Vec<(String, i64)>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any statement containing `needle` fails with `message`.
    pub fn fail_matching(&self, needle: &str, message: &str) {
        self.inner
            .failures
            .lock()
            .push((needle.to_string(), message.to_string()));
    }

    /// Any count query containing `needle` returns `count` (default 0).
    pub fn count_matching(&self, needle: &str, count: i64) {
        self.inner.counts.lock().push((needle.to_string(), count));
    }

    /// Every statement and query dispatched, in order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.executed.lock().clone()
    }

    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|sql| sql.contains(needle))
            .collect()
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.inner.executed.lock().push(sql.to_string());
        let failures = self.inner.failures.lock();
        if let Some((_, message)) = failures.iter().find(|(needle, _)| sql.contains(needle)) {
            return Err(Error::Database(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn acquire(&self) -> Result<Box<dyn DbConn>> {
        Ok(Box::new(MockConn {
            db: self.clone(),
        }))
    }
}

struct MockConn {
    db: MockDatabase,
}

#[async_trait]
impl DbConn for MockConn {
    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        // Yield so independent workers interleave like they would on real
        // connections.
        tokio::task::yield_now().await;
        self.db.record(sql)
    }

    async fn fetch_count(&mut self, sql: &str) -> Result<i64> {
        tokio::task::yield_now().await;
        self.db.record(sql)?;
        let counts = self.db.inner.counts.lock();
        Ok(counts
            .iter()
            .find(|(needle, _)| sql.contains(needle))
            .map(|(_, count)| *count)
            .unwrap_or(0))
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}
