//! Error types for the migration engine.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while loading a changelog or driving the engine.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A changelog file could not be read.
    #[error("Failed to read changelog '{path}': {source}")]
    ChangelogRead {
        /// Path of the unreadable file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A changelog file is malformed.
    #[error("Failed to parse changelog '{path}': {message}")]
    Parse {
        /// Path to the changelog file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Two changesets share the same identity.
    #[error("Duplicate changeset identity: {0}")]
    DuplicateChangeSet(String),

    /// A changelog includes itself, directly or transitively.
    #[error("Circular include detected: {}", .chain.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> "))]
    CircularInclude {
        /// Include chain, ending with the file that closes the cycle.
        chain: Vec<PathBuf>,
    },

    /// The migration lock could not be acquired in time.
    #[error("Could not acquire migration lock within {waited:?}{}", .holder.as_ref().map(|h| format!(" (held by {h})")).unwrap_or_default())]
    LockTimeout {
        /// How long acquisition was attempted.
        waited: Duration,
        /// Holder of the lock at the last attempt, if known.
        holder: Option<String>,
    },

    /// A lock handle was released twice or does not own the lock.
    #[error("Invalid lock handle: {0}")]
    InvalidHandle(String),

    /// The ledger could not be read or written.
    #[error("Ledger persistence error: {0}")]
    Persistence(#[source] sqlx::Error),

    /// An applied changeset no longer matches its recorded checksum.
    #[error("Checksum mismatch for '{changeset}': recorded {recorded}, current {current}")]
    ChecksumMismatch {
        /// Changeset identity.
        changeset: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the changelog content.
        current: String,
    },

    /// A changeset to roll back declares no inverse statements.
    #[error("No rollback defined for changeset '{0}'")]
    NoRollbackDefined(String),

    /// A ledger entry refers to a changeset missing from the changelog.
    #[error("Changeset '{0}' is recorded in the ledger but not present in the changelog")]
    UnknownChangeSet(String),

    /// A ledger entry was expected but does not exist.
    #[error("Ledger entry not found: {0}")]
    NotFound(String),

    /// Bad caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A statement failed while applying or rolling back a changeset.
    #[error("Changeset '{changeset}' failed: {source}")]
    Execution {
        /// Changeset identity.
        changeset: String,
        /// Database error reported by the statement.
        #[source]
        source: sqlx::Error,
    },

    /// The task running a locked operation panicked or was aborted.
    #[error("Operation task failed: {0}")]
    TaskFailed(String),

    /// Database error outside of changeset execution (connections, lock table).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Returns the taxonomy name reported to API callers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChangelogRead { .. }
            | Self::Parse { .. }
            | Self::DuplicateChangeSet(_)
            | Self::CircularInclude { .. } => "ParseError",
            Self::LockTimeout { .. } => "LockTimeoutError",
            Self::InvalidHandle(_) => "InvalidHandleError",
            Self::Persistence(_) => "PersistenceError",
            Self::ChecksumMismatch { .. } => "ChecksumMismatchError",
            Self::NoRollbackDefined(_) => "NoRollbackDefinedError",
            Self::UnknownChangeSet(_) => "UnknownChangeSetError",
            Self::NotFound(_) => "NotFoundError",
            Self::InvalidArgument(_) => "InvalidArgumentError",
            Self::Execution { .. } => "ExecutionError",
            Self::TaskFailed(_) => "TaskFailedError",
            Self::Database(_) => "DatabaseError",
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// Returns the identity of the changeset this error is about, if any.
    #[must_use]
    pub fn changeset(&self) -> Option<&str> {
        match self {
            Self::ChecksumMismatch { changeset, .. } | Self::Execution { changeset, .. } => {
                Some(changeset)
            }
            Self::NoRollbackDefined(id)
            | Self::UnknownChangeSet(id)
            | Self::DuplicateChangeSet(id) => Some(id),
            _ => None,
        }
    }

    /// Renders this error and all of its sources, outermost first.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
