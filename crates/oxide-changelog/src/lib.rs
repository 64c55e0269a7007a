//! Changelog-driven database migrations for Rust.
//!
//! `oxide-changelog` applies an ordered list of changesets, declared in a
//! changelog file, to a SQLite database, where:
//! - Every applied changeset is recorded in a ledger table with its checksum
//! - A lock row in the target database serializes concurrent migrators
//! - Changesets can be filtered by context and label
//! - Rollbacks run explicitly declared inverse statements
//!
//! # Architecture
//!
//! - **Changelog** - Loads JSON and formatted-SQL changelogs, following includes
//! - **Ledger** - Records which changesets ran, when and in what order
//! - **Lock** - Table-based mutual exclusion across processes
//! - **Engine** - `migrate`, `rollback`, `status`, `validate`
//! - **API** - Maps request lines onto engine calls and status codes
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_changelog::prelude::*;
//!
//! let pool = SqlitePool::connect("sqlite:app.db").await?;
//! let engine = MigrationEngine::new(pool, EngineConfig::new())?;
//!
//! let result = engine
//!     .migrate(Path::new("db/changelog.json"), &ChangeFilter::parse(Some("dev"), None))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! ```
//!
//! # Changelog
//!
//! ```sql
//! --liquibase formatted sql
//!
//! --changeset alice:1 context:dev
//! CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//! --rollback DROP TABLE users;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Apply pending changesets
//! oxide-changelog --changelog db/changelog.json migrate --contexts dev
//!
//! # Show what would run next
//! oxide-changelog status
//!
//! # Undo the last two changesets
//! oxide-changelog rollback --count 2
//! ```

pub mod api;
pub mod changelog;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod lock;
pub mod result;
pub mod session;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::api::{ApiRequest, ApiResponse, MigrationApi};
    pub use crate::changelog::{Change, ChangeLog, ChangeSet, ChangeSetId};
    pub use crate::config::{ChecksumPolicy, EngineConfig};
    pub use crate::engine::MigrationEngine;
    pub use crate::error::{MigrateError, Result};
    pub use crate::filter::ChangeFilter;
    pub use crate::ledger::{Ledger, LedgerEntry, LedgerOutcome};
    pub use crate::lock::{LockHandle, LockManager};
    pub use crate::result::{MigrationResult, Operation, Phase, Status, ValidationResult};
    pub use crate::session::DatabaseSession;
}
