//! Engine configuration.
//!
//! An [`EngineConfig`] is built once (by the CLI or by an embedding service)
//! and handed to [`MigrationEngine`](crate::engine::MigrationEngine). Nothing
//! in the engine reads process-global settings.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "oxide_changelog";

/// Default name of the lock table.
pub const DEFAULT_LOCK_TABLE: &str = "oxide_changelog_lock";

/// What to do when an applied changeset's content has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Refuse to migrate.
    #[default]
    Fail,
    /// Log a warning and continue.
    Allow,
}

impl FromStr for ChecksumPolicy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "allow" => Ok(Self::Allow),
            other => Err(MigrateError::InvalidArgument(format!(
                "unknown checksum policy '{other}' (expected 'fail' or 'allow')"
            ))),
        }
    }
}

/// Configuration shared by every engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Ledger table name.
    pub ledger_table: String,
    /// Lock table name.
    pub lock_table: String,
    /// Maximum time to wait for the migration lock.
    pub lock_timeout: Duration,
    /// First delay between lock attempts; doubled after each failed attempt.
    pub lock_poll_interval: Duration,
    /// Upper bound for the delay between lock attempts.
    pub lock_poll_max: Duration,
    /// Checksum mismatch handling.
    pub checksum_policy: ChecksumPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_timeout: Duration::from_secs(60),
            lock_poll_interval: Duration::from_millis(50),
            lock_poll_max: Duration::from_secs(2),
            checksum_policy: ChecksumPolicy::Fail,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ledger table name.
    #[must_use]
    pub fn ledger_table(mut self, name: impl Into<String>) -> Self {
        self.ledger_table = name.into();
        self
    }

    /// Sets the lock table name.
    #[must_use]
    pub fn lock_table(mut self, name: impl Into<String>) -> Self {
        self.lock_table = name.into();
        self
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the initial lock poll interval.
    #[must_use]
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Sets the checksum policy.
    #[must_use]
    pub fn checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    /// Checks that table names are plain identifiers and intervals are usable.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.ledger_table)?;
        validate_identifier(&self.lock_table)?;
        if self.ledger_table == self.lock_table {
            return Err(MigrateError::InvalidArgument(
                "ledger and lock tables must differ".to_string(),
            ));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(MigrateError::InvalidArgument(
                "lock poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MigrateError::InvalidArgument(format!(
            "'{name}' is not a valid table name"
        )))
    }
}
