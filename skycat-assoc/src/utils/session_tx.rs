//! Timed SQLite transactions for association sessions
//!
//! A session holds its transaction from the region search to the commit.
//! Pool waits and hold times are logged against a label so slow sessions
//! show up next to the conflicts they cause.

use skycat_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::{Duration, Instant};

const SLOW_ACQUIRE: Duration = Duration::from_millis(500);
const LONG_HOLD: Duration = Duration::from_secs(2);

/// Owned deferred transaction that reports how long it held its connection
pub struct SessionTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    label: &'static str,
    opened: Instant,
}

impl SessionTransaction {
    /// Wait for a pooled connection and begin a deferred transaction on it
    pub async fn open(pool: &SqlitePool, label: &'static str) -> Result<Self> {
        let requested = Instant::now();
        let tx = pool.begin().await.map_err(Error::from_store)?;

        let waited = requested.elapsed();
        if waited > SLOW_ACQUIRE {
            tracing::warn!(
                label,
                wait_ms = waited.as_millis() as u64,
                "Slow connection acquisition; pool may be saturated"
            );
        }

        Ok(Self {
            tx: Some(tx),
            label,
            opened: Instant::now(),
        })
    }

    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(Error::Internal(format!(
                "{} transaction already finished",
                self.label
            ))),
        }
    }

    /// Lock and stale-snapshot failures surface as `WriteConflict`
    pub async fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.map_err(Error::from_store)?;
        }
        self.report("commit");
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(Error::from_store)?;
        }
        self.report("rollback");
        Ok(())
    }

    fn report(&self, ending: &'static str) {
        let held = self.opened.elapsed();
        let held_ms = held.as_millis() as u64;
        if held > LONG_HOLD {
            tracing::warn!(label = self.label, ending, held_ms, "Long-held session transaction");
        } else {
            tracing::debug!(label = self.label, ending, held_ms, "Session transaction finished");
        }
    }
}

impl Drop for SessionTransaction {
    fn drop(&mut self) {
        // sqlx rolls back an unfinished transaction when it is dropped
        if self.tx.is_some() {
            self.report("drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE marks (name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM marks")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn mark(tx: &mut SessionTransaction) {
        sqlx::query("INSERT INTO marks (name) VALUES ('a')")
            .execute(tx.conn().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let pool = pool().await;
        let mut tx = SessionTransaction::open(&pool, "test").await.unwrap();
        mark(&mut tx).await;
        tx.commit().await.unwrap();
        assert_eq!(count(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let pool = pool().await;

        let mut tx = SessionTransaction::open(&pool, "test").await.unwrap();
        mark(&mut tx).await;
        tx.rollback().await.unwrap();

        let mut tx = SessionTransaction::open(&pool, "test").await.unwrap();
        mark(&mut tx).await;
        drop(tx);

        assert_eq!(count(&pool).await, 0);
    }
}
