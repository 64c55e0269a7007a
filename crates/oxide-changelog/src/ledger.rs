//! Execution ledger.
//!
//! This module manages the ledger table that records which changesets have
//! been applied to the database, with their checksum and execution order.
//! All methods run on a caller-supplied connection so ledger writes can
//! share a transaction with the changeset statements they record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;

use crate::changelog::{ChangeSet, ChangeSetId};
use crate::error::{MigrateError, Result};

/// How a ledger row came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// First execution.
    Executed,
    /// Executed again (`runAlways` / `runOnChange`).
    Reran,
}

impl LedgerOutcome {
    /// Returns the stored representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "EXECUTED",
            Self::Reran => "RERAN",
        }
    }
}

impl fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOutcome {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXECUTED" => Ok(Self::Executed),
            "RERAN" => Ok(Self::Reran),
            other => Err(MigrateError::InvalidArgument(format!(
                "unknown ledger outcome '{other}'"
            ))),
        }
    }
}

/// A record of an applied changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Changeset identity.
    pub identity: ChangeSetId,
    /// Checksum at apply time.
    pub checksum: String,
    /// Description at apply time.
    pub description: String,
    /// When the changeset was applied.
    pub applied_at: DateTime<Utc>,
    /// Position in the global execution sequence, starting at 1.
    pub execution_order: i64,
    /// Outcome.
    pub outcome: LedgerOutcome,
}

type LedgerRow = (String, String, String, String, String, String, i64, String);

/// Reads and writes the ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    /// Creates a ledger over the given (already validated) table name.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Checks whether the ledger table exists.
    pub async fn is_bootstrapped(&self, conn: &mut SqliteConnection) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(&self.table)
                .fetch_optional(&mut *conn)
                .await
                .map_err(MigrateError::Persistence)?;
        Ok(row.is_some())
    }

    /// Creates the ledger table if it does not exist.
    pub async fn bootstrap(&self, conn: &mut SqliteConnection) -> Result<()> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    id TEXT NOT NULL,
    author TEXT NOT NULL,
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    applied_at TEXT NOT NULL,
    execution_order INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    PRIMARY KEY (id, author, filename)
)
"#,
            table = self.table
        );
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(MigrateError::Persistence)?;
        Ok(())
    }

    /// Returns all entries ordered by execution order ascending.
    pub async fn applied_entries(&self, conn: &mut SqliteConnection) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            r#"SELECT id, author, filename, checksum, description, applied_at, execution_order, outcome
               FROM "{}" ORDER BY execution_order"#,
            self.table
        );
        let rows: Vec<LedgerRow> = sqlx::query_as(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(MigrateError::Persistence)?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Records a changeset as applied.
    ///
    /// A changeset that is already recorded (a rerun) has its row updated
    /// with the new checksum, time and execution order. Inside a transaction
    /// the row becomes durable when the caller commits; otherwise when this
    /// returns.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        change_set: &ChangeSet,
    ) -> Result<LedgerEntry> {
        let sql = format!(
            r#"
INSERT INTO "{table}" (id, author, filename, checksum, description, applied_at, execution_order, outcome)
VALUES (?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(execution_order), 0) + 1 FROM "{table}"), 'EXECUTED')
ON CONFLICT (id, author, filename) DO UPDATE SET
    checksum = excluded.checksum,
    description = excluded.description,
    applied_at = excluded.applied_at,
    execution_order = excluded.execution_order,
    outcome = 'RERAN'
RETURNING execution_order, outcome
"#,
            table = self.table
        );

        let identity = &change_set.identity;
        let checksum = change_set.checksum();
        let description = change_set.description();
        let applied_at = Utc::now();

        let (execution_order, outcome): (i64, String) = sqlx::query_as(&sql)
            .bind(&identity.id)
            .bind(&identity.author)
            .bind(&identity.path)
            .bind(&checksum)
            .bind(&description)
            .bind(applied_at.to_rfc3339())
            .fetch_one(&mut *conn)
            .await
            .map_err(MigrateError::Persistence)?;

        Ok(LedgerEntry {
            identity: identity.clone(),
            checksum,
            description,
            applied_at,
            execution_order,
            outcome: outcome.parse()?,
        })
    }

    /// Removes the entry for a changeset (for rollback).
    pub async fn remove(&self, conn: &mut SqliteConnection, identity: &ChangeSetId) -> Result<()> {
        let sql = format!(
            r#"DELETE FROM "{}" WHERE id = ? AND author = ? AND filename = ?"#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&identity.id)
            .bind(&identity.author)
            .bind(&identity.path)
            .execute(&mut *conn)
            .await
            .map_err(MigrateError::Persistence)?;

        if result.rows_affected() == 0 {
            return Err(MigrateError::NotFound(identity.to_string()));
        }
        Ok(())
    }
}

fn entry_from_row(row: LedgerRow) -> Result<LedgerEntry> {
    let (id, author, filename, checksum, description, applied_at, execution_order, outcome) = row;
    Ok(LedgerEntry {
        identity: ChangeSetId::new(id, author, filename),
        checksum,
        description,
        applied_at: parse_timestamp(&applied_at),
        execution_order,
        outcome: outcome.parse()?,
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime format fallback
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
