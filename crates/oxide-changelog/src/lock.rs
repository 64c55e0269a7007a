//! Table-based migration lock.
//!
//! The lock is a single row (`id = 1`) in the lock table. The session that
//! inserts it holds the lock; everyone else polls with exponential backoff
//! until the row disappears or their timeout runs out. Because the lock
//! lives in the target database it excludes engines in other processes and
//! on other hosts, not just other tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{MigrateError, Result};

/// Proof of lock ownership. Consumed by [`LockManager::release`].
#[derive(Debug)]
#[must_use = "a lock handle must be released"]
pub struct LockHandle {
    holder_id: String,
    acquired_at: DateTime<Utc>,
}

impl LockHandle {
    /// Identifier written into the lock row.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// When the lock was acquired.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Current lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Holder identifier.
    pub holder_id: String,
    /// Acquisition time as stored.
    pub acquired_at: String,
}

/// Acquires and releases the migration lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: String,
    poll_interval: Duration,
    poll_max: Duration,
}

impl LockManager {
    /// Creates a lock manager from the engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            table: config.lock_table.clone(),
            poll_interval: config.lock_poll_interval,
            poll_max: config.lock_poll_max,
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the lock table if it does not exist.
    pub async fn bootstrap(&self, conn: &mut SqliteConnection) -> Result<()> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS "{}" (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL
)
"#,
            self.table
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    /// Acquires the lock, polling until `timeout` elapses.
    pub async fn acquire(&self, conn: &mut SqliteConnection, timeout: Duration) -> Result<LockHandle> {
        let holder_id = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let started = Instant::now();
        let mut delay = self.poll_interval;
        let sql = format!(
            r#"INSERT OR IGNORE INTO "{}" (id, holder_id, acquired_at) VALUES (1, ?, ?)"#,
            self.table
        );

        loop {
            let acquired_at = Utc::now();
            let attempt = sqlx::query(&sql)
                .bind(&holder_id)
                .bind(acquired_at.to_rfc3339())
                .execute(&mut *conn)
                .await;

            match attempt {
                Ok(done) if done.rows_affected() == 1 => {
                    info!(holder = %holder_id, "Acquired migration lock");
                    return Ok(LockHandle {
                        holder_id,
                        acquired_at,
                    });
                }
                Ok(_) => debug!("Migration lock is held, waiting"),
                Err(err) if is_contention(&err) => {
                    debug!(error = %err, "Lock table busy, waiting");
                }
                Err(err) => return Err(err.into()),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let holder = self
                    .current_holder(conn)
                    .await
                    .ok()
                    .flatten()
                    .map(|info| info.holder_id);
                warn!(?waited, ?holder, "Timed out waiting for migration lock");
                return Err(MigrateError::LockTimeout { waited, holder });
            }

            sleep(delay.min(timeout - waited)).await;
            delay = delay.saturating_mul(2).min(self.poll_max);
        }
    }

    /// Releases a held lock.
    ///
    /// Fails with [`MigrateError::InvalidHandle`] if the row no longer
    /// belongs to this handle (e.g. it was force-released).
    pub async fn release(&self, conn: &mut SqliteConnection, handle: LockHandle) -> Result<()> {
        let sql = format!(
            r#"DELETE FROM "{}" WHERE id = 1 AND holder_id = ?"#,
            self.table
        );
        let done = sqlx::query(&sql)
            .bind(&handle.holder_id)
            .execute(&mut *conn)
            .await?;

        if done.rows_affected() == 0 {
            return Err(MigrateError::InvalidHandle(format!(
                "lock is not held by {}",
                handle.holder_id
            )));
        }
        info!(holder = %handle.holder_id, "Released migration lock");
        Ok(())
    }

    /// Returns the current holder, if the lock is held.
    pub async fn current_holder(&self, conn: &mut SqliteConnection) -> Result<Option<LockInfo>> {
        let sql = format!(
            r#"SELECT holder_id, acquired_at FROM "{}" WHERE id = 1"#,
            self.table
        );
        let row: Option<(String, String)> = sqlx::query_as(&sql).fetch_optional(&mut *conn).await?;
        Ok(row.map(|(holder_id, acquired_at)| LockInfo {
            holder_id,
            acquired_at,
        }))
    }

    /// Removes the lock row regardless of holder. Returns whether a lock was held.
    ///
    /// Only for recovering from a holder that died without releasing.
    pub async fn force_release(&self, conn: &mut SqliteConnection) -> Result<bool> {
        let sql = format!(r#"DELETE FROM "{}" WHERE id = 1"#, self.table);
        let done = sqlx::query(&sql).execute(&mut *conn).await?;
        let released = done.rows_affected() > 0;
        if released {
            warn!("Forcibly released migration lock");
        }
        Ok(released)
    }
}

/// SQLite reports a competing writer as busy or locked; that is contention, not failure.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}
