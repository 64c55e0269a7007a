//! Database capability interface.
//!
//! The engine runs changeset statements through [`DatabaseSession`] and
//! nothing else, so a new target only has to provide statement execution
//! and transaction control.

use futures::future::BoxFuture;
use sqlx::sqlite::SqliteConnection;

/// Statement execution and transaction control on one database session.
pub trait DatabaseSession: Send {
    /// Returns the dialect name.
    fn dialect(&self) -> &'static str;

    /// Executes one statement, returning the number of affected rows.
    fn execute_statement<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<u64, sqlx::Error>>;

    /// Opens a transaction.
    fn begin_transaction(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    /// Commits the open transaction.
    fn commit(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;

    /// Discards the open transaction.
    fn rollback_transaction(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>>;
}

impl DatabaseSession for SqliteConnection {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    fn execute_statement<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
        Box::pin(async move {
            let done = sqlx::Executor::execute(&mut *self, sqlx::raw_sql(sql)).await?;
            Ok(done.rows_affected())
        })
    }

    fn begin_transaction(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        // IMMEDIATE takes the write lock up front so two sessions never
        // deadlock upgrading from a read lock.
        Box::pin(async move {
            sqlx::Executor::execute(&mut *self, sqlx::raw_sql("BEGIN IMMEDIATE")).await?;
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        Box::pin(async move {
            sqlx::Executor::execute(&mut *self, sqlx::raw_sql("COMMIT")).await?;
            Ok(())
        })
    }

    fn rollback_transaction(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        Box::pin(async move {
            sqlx::Executor::execute(&mut *self, sqlx::raw_sql("ROLLBACK")).await?;
            Ok(())
        })
    }
}
