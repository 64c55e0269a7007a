#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oxide_changelog::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Single-connection in-memory database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

/// File-backed database shared between pools, in WAL mode.
pub async fn file_pool(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .unwrap_or_else(|e| panic!("Failed to open {}: {e}", path.display()))
}

pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .lock_timeout(Duration::from_secs(10))
        .lock_poll_interval(Duration::from_millis(5))
}

pub async fn engine(pool: SqlitePool) -> MigrationEngine {
    MigrationEngine::new(pool, test_config()).expect("valid config")
}

/// Writes a file under `dir`, creating parent directories.
pub fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Writes a formatted SQL changelog.
pub fn formatted_sql(dir: &Path, name: &str, body: &str) -> PathBuf {
    write(dir, name, &format!("--liquibase formatted sql\n\n{body}"))
}

/// Ids of applied changesets, in execution order.
pub async fn applied_ids(engine: &MigrationEngine) -> Vec<String> {
    let mut conn = engine.connection().await.unwrap();
    if !engine.ledger().is_bootstrapped(&mut conn).await.unwrap() {
        return Vec::new();
    }
    engine
        .ledger()
        .applied_entries(&mut conn)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.identity.id)
        .collect()
}

pub async fn table_exists(engine: &MigrationEngine, name: &str) -> bool {
    let mut conn = engine.connection().await.unwrap();
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .unwrap();
    row.is_some()
}
