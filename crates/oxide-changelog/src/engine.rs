//! Migration engine.
//!
//! Each operation takes the changelog path explicitly, borrows one pooled
//! connection for its whole duration, and reports a [`MigrationResult`]
//! instead of an error: failures are converted at the operation boundary,
//! after the lock (if taken) has been released.
//!
//! `migrate` and `rollback` run under the database lock:
//!
//! ```text
//! IDLE -> LOCKING -> APPLYING | ROLLING_BACK -> IDLE
//!                          \________________/
//!                                 FAILED (lock released first)
//! ```
//!
//! Changesets are applied in changelog order and the run stops at the first
//! failure. Changesets applied earlier in the same run stay applied.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, error, info, warn};

use crate::changelog::{ChangeLog, ChangeSet, ChangeSetId};
use crate::config::{ChecksumPolicy, EngineConfig};
use crate::error::{MigrateError, Result};
use crate::filter::ChangeFilter;
use crate::ledger::{Ledger, LedgerEntry};
use crate::lock::LockManager;
use crate::result::{MigrationResult, Operation, Phase, ValidationResult};
use crate::session::DatabaseSession;

/// An error together with the phase it happened in.
#[derive(Debug)]
struct Failure {
    phase: Phase,
    error: MigrateError,
}

impl Failure {
    fn at(phase: Phase) -> impl FnOnce(MigrateError) -> Self {
        move |error| Self { phase, error }
    }
}

/// Drives changelog migrations against one database.
#[derive(Clone)]
pub struct MigrationEngine {
    pool: SqlitePool,
    config: EngineConfig,
    ledger: Ledger,
    locks: LockManager,
}

impl MigrationEngine {
    /// Creates a new engine. Fails if the configuration is invalid.
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            ledger: Ledger::new(config.ledger_table.clone()),
            locks: LockManager::new(&config),
            config,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Borrows a connection from the pool. It returns to the pool when dropped.
    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Applies every pending changeset that matches `filter`.
    pub async fn migrate(&self, changelog: &Path, filter: &ChangeFilter) -> MigrationResult {
        info!(
            changelog = %changelog.display(),
            contexts = ?filter.contexts(),
            labels = ?filter.labels(),
            "Starting migration"
        );

        let engine = self.clone();
        let source = changelog.to_path_buf();
        let selection = filter.clone();
        let (applied, outcome) = detached(async move {
            let mut applied = Vec::new();
            let outcome = engine.run_migrate(&source, &selection, &mut applied).await;
            (applied, outcome)
        })
        .await;

        let result = match outcome {
            Ok(()) => {
                info!(applied = applied.len(), "Migration completed successfully");
                MigrationResult::success(Operation::Migrate, "Migration completed successfully")
            }
            Err(Failure { phase, error }) => {
                error!(?phase, error = %error, applied = applied.len(), "Migration failed");
                MigrationResult::failure(Operation::Migrate, phase, &error)
            }
        };

        result
            .with_changesets(&applied)
            .with_filter(filter.contexts(), filter.labels())
            .with_changelog(changelog)
    }

    /// Rolls back the `count` most recently applied changesets.
    pub async fn rollback(&self, changelog: &Path, count: i64) -> MigrationResult {
        info!(changelog = %changelog.display(), count, "Starting rollback");

        let count = match usize::try_from(count) {
            Ok(count) if count >= 1 => count,
            _ => {
                let error = MigrateError::InvalidArgument(format!(
                    "rollback count must be a positive integer, got {count}"
                ));
                warn!(error = %error, "Rejected rollback");
                return MigrationResult::failure(Operation::Rollback, Phase::Reading, &error)
                    .with_changelog(changelog);
            }
        };

        let engine = self.clone();
        let source = changelog.to_path_buf();
        let (rolled_back, outcome) = detached(async move {
            let mut rolled_back = Vec::new();
            let outcome = engine.run_rollback(&source, count, &mut rolled_back).await;
            (rolled_back, outcome)
        })
        .await;

        let mut result = match outcome {
            Ok(()) => {
                info!(rolled_back = rolled_back.len(), "Rollback completed successfully");
                MigrationResult::success(
                    Operation::Rollback,
                    format!(
                        "Rollback of {} changesets completed successfully",
                        rolled_back.len()
                    ),
                )
            }
            Err(Failure { phase, error }) => {
                error!(?phase, error = %error, rolled_back = rolled_back.len(), "Rollback failed");
                MigrationResult::failure(Operation::Rollback, phase, &error)
            }
        };

        result.rollback_count = Some(rolled_back.len());
        result.with_changesets(&rolled_back).with_changelog(changelog)
    }

    /// Reports how many changesets are pending and which runs next.
    pub async fn status(&self, changelog: &Path, filter: &ChangeFilter) -> MigrationResult {
        match self.pending_change_sets(changelog, filter).await {
            Ok(pending) => {
                info!(pending = pending.len(), "Migration status retrieved");
                let mut result = MigrationResult::success(
                    Operation::Status,
                    format!("{} pending changesets", pending.len()),
                );
                result.pending_changesets = Some(pending.len());
                result.next_changeset = pending.first().map(|cs| cs.identity.to_string());
                result
                    .with_filter(filter.contexts(), filter.labels())
                    .with_changelog(changelog)
            }
            Err(error) => {
                error!(error = %error, "Failed to get migration status");
                MigrationResult::failure(Operation::Status, Phase::Reading, &error)
                    .with_changelog(changelog)
            }
        }
    }

    /// Checks the changelog and the ledger for inconsistencies.
    pub async fn validate(&self, changelog: &Path, filter: &ChangeFilter) -> MigrationResult {
        match self.validation_report(changelog, filter).await {
            Ok(report) if report.is_valid() => {
                info!(warnings = report.warnings.len(), "Changelog validation passed");
                let mut result =
                    MigrationResult::success(Operation::Validate, "Changelog validation passed");
                result.validation = Some(report);
                result.with_changelog(changelog)
            }
            Ok(report) => {
                warn!(errors = report.errors.len(), "Changelog validation failed");
                MigrationResult::invalid(report).with_changelog(changelog)
            }
            Err(error) => {
                error!(error = %error, "Changelog validation failed");
                let mut result =
                    MigrationResult::failure(Operation::Validate, Phase::Reading, &error);
                result.validation = Some(ValidationResult {
                    errors: vec![error.to_string()],
                    warnings: Vec::new(),
                });
                result.with_changelog(changelog)
            }
        }
    }

    /// Returns the changesets `migrate` would apply, in changelog order.
    ///
    /// Takes no lock: the answer may be stale if a migration is running.
    pub async fn pending_change_sets(
        &self,
        changelog: &Path,
        filter: &ChangeFilter,
    ) -> Result<Vec<ChangeSet>> {
        let changelog = ChangeLog::load(changelog)?;
        let mut conn = self.connection().await?;
        let entries = self.read_ledger(&mut conn).await?;
        Ok(select_pending(&changelog, &entries, filter)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Builds a validation report without touching the lock or the ledger contents.
    pub async fn validation_report(
        &self,
        changelog: &Path,
        filter: &ChangeFilter,
    ) -> Result<ValidationResult> {
        let mut report = ValidationResult::default();
        let changelog = match ChangeLog::load(changelog) {
            Ok(changelog) => changelog,
            Err(err) => {
                report.errors.push(err.to_string());
                return Ok(report);
            }
        };

        let mut conn = self.connection().await?;
        let entries = self.read_ledger(&mut conn).await?;
        let in_scope: Vec<LedgerEntry> = entries
            .iter()
            .filter(|e| changelog.get(&e.identity).map_or(true, |cs| filter.matches(cs)))
            .cloned()
            .collect();

        for mismatch in checksum_mismatches(&changelog, &in_scope) {
            let message = mismatch.to_string();
            match self.config.checksum_policy {
                ChecksumPolicy::Fail => report.errors.push(message),
                ChecksumPolicy::Allow => report.warnings.push(message),
            }
        }

        for entry in &entries {
            match changelog.get(&entry.identity) {
                None => report.warnings.push(
                    MigrateError::UnknownChangeSet(entry.identity.to_string()).to_string(),
                ),
                Some(change_set) if filter.matches(change_set) && change_set.rollback.is_none() => {
                    report.warnings.push(
                        MigrateError::NoRollbackDefined(entry.identity.to_string()).to_string(),
                    );
                }
                Some(_) => {}
            }
        }

        debug!(
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Validation finished"
        );
        Ok(report)
    }

    /// Forcibly removes the lock row. Returns whether a lock was held.
    pub async fn release_locks(&self) -> Result<bool> {
        let mut conn = self.connection().await?;
        self.locks.bootstrap(&mut conn).await?;
        self.locks.force_release(&mut conn).await
    }

    /// Reads the ledger, treating a missing table as an empty ledger.
    async fn read_ledger(&self, conn: &mut SqliteConnection) -> Result<Vec<LedgerEntry>> {
        if self.ledger.is_bootstrapped(conn).await? {
            self.ledger.applied_entries(conn).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn run_migrate(
        &self,
        changelog: &Path,
        filter: &ChangeFilter,
        applied: &mut Vec<ChangeSetId>,
    ) -> std::result::Result<(), Failure> {
        let changelog = ChangeLog::load(changelog).map_err(Failure::at(Phase::Reading))?;
        let mut conn = self.connection().await.map_err(Failure::at(Phase::Locking))?;
        self.prepare(&mut conn).await.map_err(Failure::at(Phase::Locking))?;

        let handle = self
            .locks
            .acquire(&mut conn, self.config.lock_timeout)
            .await
            .map_err(Failure::at(Phase::Locking))?;

        let outcome = self.apply_pending(&mut conn, &changelog, filter, applied).await;
        let released = self.locks.release(&mut conn, handle).await;
        finish(outcome, released)
    }

    async fn run_rollback(
        &self,
        changelog: &Path,
        count: usize,
        rolled_back: &mut Vec<ChangeSetId>,
    ) -> std::result::Result<(), Failure> {
        let changelog = ChangeLog::load(changelog).map_err(Failure::at(Phase::Reading))?;
        let mut conn = self.connection().await.map_err(Failure::at(Phase::Locking))?;
        self.prepare(&mut conn).await.map_err(Failure::at(Phase::Locking))?;

        let handle = self
            .locks
            .acquire(&mut conn, self.config.lock_timeout)
            .await
            .map_err(Failure::at(Phase::Locking))?;

        let outcome = self
            .roll_back_latest(&mut conn, &changelog, count, rolled_back)
            .await;
        let released = self.locks.release(&mut conn, handle).await;
        finish(outcome, released)
    }

    async fn prepare(&self, conn: &mut SqliteConnection) -> Result<()> {
        self.ledger.bootstrap(conn).await?;
        self.locks.bootstrap(conn).await
    }

    async fn apply_pending(
        &self,
        conn: &mut SqliteConnection,
        changelog: &ChangeLog,
        filter: &ChangeFilter,
        applied: &mut Vec<ChangeSetId>,
    ) -> std::result::Result<(), Failure> {
        let entries = self
            .ledger
            .applied_entries(conn)
            .await
            .map_err(Failure::at(Phase::Applying))?;

        for mismatch in checksum_mismatches(changelog, &entries) {
            match self.config.checksum_policy {
                ChecksumPolicy::Fail => {
                    return Err(Failure {
                        phase: Phase::Applying,
                        error: mismatch,
                    })
                }
                ChecksumPolicy::Allow => warn!(error = %mismatch, "Ignoring checksum mismatch"),
            }
        }

        let pending = select_pending(changelog, &entries, filter);
        debug!(pending = pending.len(), "Computed pending changesets");

        for change_set in pending {
            self.apply_one(conn, change_set)
                .await
                .map_err(Failure::at(Phase::Applying))?;
            applied.push(change_set.identity.clone());
        }
        Ok(())
    }

    async fn apply_one(&self, conn: &mut SqliteConnection, change_set: &ChangeSet) -> Result<()> {
        info!(changeset = %change_set.identity, "Applying changeset");
        let statements: Vec<&str> = change_set.statements().collect();

        if !change_set.run_in_transaction {
            execute_all(conn, &change_set.identity, &statements).await?;
            self.ledger.record(conn, change_set).await?;
            return Ok(());
        }

        conn.begin_transaction().await?;
        let outcome = self.execute_and_record(conn, change_set, &statements).await;
        commit_or_discard(conn, &change_set.identity, outcome).await?;
        info!(changeset = %change_set.identity, "Changeset applied");
        Ok(())
    }

    async fn execute_and_record(
        &self,
        conn: &mut SqliteConnection,
        change_set: &ChangeSet,
        statements: &[&str],
    ) -> Result<()> {
        execute_all(conn, &change_set.identity, statements).await?;
        let entry = self.ledger.record(conn, change_set).await?;
        debug!(
            changeset = %change_set.identity,
            execution_order = entry.execution_order,
            outcome = %entry.outcome,
            "Recorded changeset"
        );
        Ok(())
    }

    async fn roll_back_latest(
        &self,
        conn: &mut SqliteConnection,
        changelog: &ChangeLog,
        count: usize,
        rolled_back: &mut Vec<ChangeSetId>,
    ) -> std::result::Result<(), Failure> {
        let entries = self
            .ledger
            .applied_entries(conn)
            .await
            .map_err(Failure::at(Phase::RollingBack))?;

        if entries.len() < count {
            warn!(
                requested = count,
                available = entries.len(),
                "Fewer applied changesets than requested; rolling back all"
            );
        }

        for entry in entries.iter().rev().take(count) {
            self.roll_back_one(conn, changelog, entry)
                .await
                .map_err(Failure::at(Phase::RollingBack))?;
            rolled_back.push(entry.identity.clone());
        }
        Ok(())
    }

    async fn roll_back_one(
        &self,
        conn: &mut SqliteConnection,
        changelog: &ChangeLog,
        entry: &LedgerEntry,
    ) -> Result<()> {
        let identity = &entry.identity;
        info!(changeset = %identity, "Rolling back changeset");

        let change_set = changelog
            .get(identity)
            .ok_or_else(|| MigrateError::UnknownChangeSet(identity.to_string()))?;
        let statements = change_set
            .rollback_statements()
            .ok_or_else(|| MigrateError::NoRollbackDefined(identity.to_string()))?;

        if !change_set.run_in_transaction {
            execute_all(conn, identity, &statements).await?;
            return self.ledger.remove(conn, identity).await;
        }

        conn.begin_transaction().await?;
        let outcome = match execute_all(conn, identity, &statements).await {
            Ok(()) => self.ledger.remove(conn, identity).await,
            Err(err) => Err(err),
        };
        commit_or_discard(conn, identity, outcome).await?;
        info!(changeset = %identity, "Changeset rolled back");
        Ok(())
    }
}

/// Runs a locked operation on its own task.
///
/// Dropping the caller's future does not cancel the task: it always reaches
/// the lock release and leaves no transaction open on the pooled connection.
async fn detached<F>(work: F) -> (Vec<ChangeSetId>, std::result::Result<(), Failure>)
where
    F: Future<Output = (Vec<ChangeSetId>, std::result::Result<(), Failure>)> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(done) => done,
        Err(err) => (
            Vec::new(),
            Err(Failure {
                phase: Phase::Applying,
                error: MigrateError::TaskFailed(err.to_string()),
            }),
        ),
    }
}

/// Runs statements in order, attributing failures to the changeset.
async fn execute_all<S>(session: &mut S, identity: &ChangeSetId, statements: &[&str]) -> Result<()>
where
    S: DatabaseSession + ?Sized,
{
    for sql in statements {
        debug!(changeset = %identity, sql = %sql, "Executing SQL");
        session
            .execute_statement(sql)
            .await
            .map_err(|source| MigrateError::Execution {
                changeset: identity.to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Commits after success; after failure rolls back and returns the statement error.
async fn commit_or_discard<S>(session: &mut S, identity: &ChangeSetId, outcome: Result<()>) -> Result<()>
where
    S: DatabaseSession + ?Sized,
{
    match outcome {
        Ok(()) => session
            .commit()
            .await
            .map_err(|source| MigrateError::Execution {
                changeset: identity.to_string(),
                source,
            }),
        Err(err) => {
            if let Err(rollback_err) = session.rollback_transaction().await {
                error!(changeset = %identity, error = %rollback_err, "Failed to roll back transaction");
            }
            Err(err)
        }
    }
}

/// Combines an operation outcome with the lock release outcome.
fn finish(
    outcome: std::result::Result<(), Failure>,
    released: Result<()>,
) -> std::result::Result<(), Failure> {
    match (outcome, released) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(error)) => Err(Failure {
            phase: Phase::Locking,
            error,
        }),
        (Err(failure), Ok(())) => Err(failure),
        (Err(failure), Err(release_err)) => {
            error!(error = %release_err, "Failed to release migration lock");
            Err(failure)
        }
    }
}

/// Changesets that are not applied (or must run again), in changelog order.
pub(crate) fn select_pending<'a>(
    changelog: &'a ChangeLog,
    entries: &[LedgerEntry],
    filter: &ChangeFilter,
) -> Vec<&'a ChangeSet> {
    let recorded: HashMap<&ChangeSetId, &LedgerEntry> =
        entries.iter().map(|e| (&e.identity, e)).collect();

    changelog
        .iter()
        .filter(|cs| filter.matches(cs))
        .filter(|cs| match recorded.get(&cs.identity) {
            None => true,
            Some(entry) => cs.run_always || (cs.run_on_change && entry.checksum != cs.checksum()),
        })
        .collect()
}

/// Applied changesets whose current content differs from what was recorded.
pub(crate) fn checksum_mismatches(changelog: &ChangeLog, entries: &[LedgerEntry]) -> Vec<MigrateError> {
    entries
        .iter()
        .filter_map(|entry| {
            let change_set = changelog.get(&entry.identity)?;
            let current = change_set.checksum();
            (!change_set.run_on_change && current != entry.checksum).then(|| {
                MigrateError::ChecksumMismatch {
                    changeset: entry.identity.to_string(),
                    recorded: entry.checksum.clone(),
                    current,
                }
            })
        })
        .collect()
}
