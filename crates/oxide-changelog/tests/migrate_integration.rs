//! Integration tests for migrate, rollback, status and validate.
//!
//! Each test writes a changelog tree into a temporary directory and runs
//! the engine against a single-connection in-memory database.

mod common;

use oxide_changelog::prelude::*;

use common::{applied_ids, engine, formatted_sql, memory_pool, table_exists, write};

// =============================================================================
// Changelog fixtures
// =============================================================================

const MASTER: &str = r#"{"databaseChangeLog": [
  {"changeSet": {
    "id": "1", "author": "alice", "comment": "create users",
    "changes": [{"sql": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"}],
    "rollback": [{"sql": "DROP TABLE users"}]
  }},
  {"include": {"file": "release-2/changes.sql"}},
  {"changeSet": {
    "id": "3", "author": "bob", "context": "dev",
    "changes": [{"sqlFile": {"path": "seed/users.sql"}}],
    "rollback": [{"sql": "DELETE FROM users"}]
  }}
]}"#;

const RELEASE_2: &str = "\
--changeset alice:2 labels:core
ALTER TABLE users ADD COLUMN email TEXT;
CREATE INDEX idx_users_email ON users (email);
--rollback DROP INDEX idx_users_email;
--rollback ALTER TABLE users DROP COLUMN email;
";

const SEED: &str = "\
INSERT INTO users (name) VALUES ('ada');
INSERT INTO users (name) VALUES ('linus');
";

fn changelog_tree(dir: &std::path::Path) -> std::path::PathBuf {
    formatted_sql(dir, "release-2/changes.sql", RELEASE_2);
    write(dir, "seed/users.sql", SEED);
    write(dir, "master.json", MASTER)
}

// =============================================================================
// Migrate
// =============================================================================

#[tokio::test]
async fn test_migrate_follows_includes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;

    let result = engine.migrate(&master, &ChangeFilter::all()).await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(
        result.changesets,
        vec![
            "master.json::1::alice",
            "release-2/changes.sql::2::alice",
            "master.json::3::bob",
        ]
    );
    assert_eq!(applied_ids(&engine).await, vec!["1", "2", "3"]);

    let mut conn = engine.connection().await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_second_migrate_applies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;

    assert!(engine.migrate(&master, &ChangeFilter::all()).await.is_success());
    let second = engine.migrate(&master, &ChangeFilter::all()).await;
    assert!(second.is_success());
    assert!(second.changesets.is_empty());

    let mut conn = engine.connection().await.unwrap();
    let entries = engine.ledger().applied_entries(&mut conn).await.unwrap();
    let orders: Vec<i64> = entries.iter().map(|e| e.execution_order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert!(entries.iter().all(|e| e.outcome == LedgerOutcome::Executed));
    assert_eq!(entries[0].description, "create users");
}

#[tokio::test]
async fn test_failure_keeps_earlier_changesets() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = formatted_sql(
        dir.path(),
        "changelog.sql",
        "\
--changeset ops:A
CREATE TABLE a (id INTEGER);
--changeset ops:B
CREATE TABLE b (id INTEGER);
INSERT INTO b (missing_column) VALUES (1);
--changeset ops:C
CREATE TABLE c (id INTEGER);
",
    );
    let engine = engine(memory_pool().await).await;

    let result = engine.migrate(&changelog, &ChangeFilter::all()).await;
    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.failed_changeset.as_deref(), Some("changelog.sql::B::ops"));
    assert_eq!(result.phase, Some(Phase::Applying));
    assert!(result.error.as_deref().unwrap().contains("caused by:"));
    assert_eq!(applied_ids(&engine).await, vec!["A"]);
    assert!(table_exists(&engine, "a").await);
    assert!(!table_exists(&engine, "b").await);

    // Fix the changeset and resume where it stopped
    formatted_sql(
        dir.path(),
        "changelog.sql",
        "\
--changeset ops:A
CREATE TABLE a (id INTEGER);
--changeset ops:B
CREATE TABLE b (id INTEGER);
--changeset ops:C
CREATE TABLE c (id INTEGER);
",
    );
    let resumed = engine.migrate(&changelog, &ChangeFilter::all()).await;
    assert!(resumed.is_success(), "{resumed:?}");
    assert_eq!(
        resumed.changesets,
        vec!["changelog.sql::B::ops", "changelog.sql::C::ops"]
    );
}

#[tokio::test]
async fn test_label_filter() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;

    // Only changeset 2 carries a label; 1 and 3 declare none and always match
    let result = engine
        .migrate(&master, &ChangeFilter::parse(None, Some("Reporting")))
        .await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.labels.as_deref(), Some("reporting"));
    assert_eq!(applied_ids(&engine).await, vec!["1", "3"]);
    assert_eq!(result.failed_changeset, None);
}

#[tokio::test]
async fn test_parse_error_is_reported_before_locking() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = write(dir.path(), "broken.json", r#"{"databaseChangeLog": [{"changeSet": {"id": "1"}}]}"#);
    let engine = engine(memory_pool().await).await;

    let result = engine.migrate(&changelog, &ChangeFilter::all()).await;
    assert_eq!(result.error_kind.as_deref(), Some("ParseError"));
    assert_eq!(result.phase, Some(Phase::Reading));

    let mut conn = engine.connection().await.unwrap();
    assert!(!engine.ledger().is_bootstrapped(&mut conn).await.unwrap());
}

#[tokio::test]
async fn test_circular_include() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.json",
        r#"{"databaseChangeLog": [{"include": {"file": "b.json"}}]}"#,
    );
    write(
        dir.path(),
        "b.json",
        r#"{"databaseChangeLog": [{"include": {"file": "a.json"}}]}"#,
    );
    let engine = engine(memory_pool().await).await;

    let result = engine
        .migrate(&dir.path().join("a.json"), &ChangeFilter::all())
        .await;
    assert_eq!(result.error_kind.as_deref(), Some("ParseError"));
    assert!(result.message.starts_with("Circular include detected"));
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_rollback_latest_first() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;
    assert!(engine.migrate(&master, &ChangeFilter::all()).await.is_success());

    let result = engine.rollback(&master, 2).await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.message, "Rollback of 2 changesets completed successfully");
    assert_eq!(
        result.changesets,
        vec!["master.json::3::bob", "release-2/changes.sql::2::alice"]
    );
    assert_eq!(applied_ids(&engine).await, vec!["1"]);

    // Rolled back changesets are pending again
    let pending = engine
        .pending_change_sets(&master, &ChangeFilter::all())
        .await
        .unwrap();
    let ids: Vec<&str> = pending.iter().map(|cs| cs.identity.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);
}

#[tokio::test]
async fn test_rollback_unknown_changeset() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = formatted_sql(
        dir.path(),
        "changelog.sql",
        "--changeset ops:A\nCREATE TABLE a (id INTEGER);\n--rollback DROP TABLE a;\n--changeset ops:B\nCREATE TABLE b (id INTEGER);\n--rollback DROP TABLE b;\n",
    );
    let engine = engine(memory_pool().await).await;
    assert!(engine.migrate(&changelog, &ChangeFilter::all()).await.is_success());

    // B disappears from the changelog
    formatted_sql(
        dir.path(),
        "changelog.sql",
        "--changeset ops:A\nCREATE TABLE a (id INTEGER);\n--rollback DROP TABLE a;\n",
    );
    let result = engine.rollback(&changelog, 1).await;
    assert_eq!(result.error_kind.as_deref(), Some("UnknownChangeSetError"));
    assert_eq!(result.rollback_count, Some(0));
    assert_eq!(applied_ids(&engine).await, vec!["A", "B"]);
}

#[tokio::test]
async fn test_empty_rollback_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = formatted_sql(
        dir.path(),
        "changelog.sql",
        "--changeset ops:A\nCREATE TABLE a (id INTEGER);\n--rollback empty\n",
    );
    let engine = engine(memory_pool().await).await;
    assert!(engine.migrate(&changelog, &ChangeFilter::all()).await.is_success());

    let result = engine.rollback(&changelog, 1).await;
    assert!(result.is_success(), "{result:?}");
    assert!(applied_ids(&engine).await.is_empty());
    assert!(table_exists(&engine, "a").await);
}

// =============================================================================
// Status and validate
// =============================================================================

#[tokio::test]
async fn test_status_with_context() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;

    let all = engine.status(&master, &ChangeFilter::all()).await;
    assert_eq!(all.pending_changesets, Some(3));
    assert_eq!(all.next_changeset.as_deref(), Some("master.json::1::alice"));
    assert_eq!(all.changelog_file, Some(master.display().to_string()));

    let prod = engine
        .status(&master, &ChangeFilter::parse(Some("prod"), None))
        .await;
    assert_eq!(prod.pending_changesets, Some(2));
    assert_eq!(prod.contexts.as_deref(), Some("prod"));
}

#[tokio::test]
async fn test_validate_warns_about_unknown_ledger_entries() {
    let dir = tempfile::tempdir().unwrap();
    let master = changelog_tree(dir.path());
    let engine = engine(memory_pool().await).await;
    assert!(engine.migrate(&master, &ChangeFilter::all()).await.is_success());

    write(
        dir.path(),
        "master.json",
        r#"{"databaseChangeLog": [
  {"changeSet": {
    "id": "1", "author": "alice", "comment": "create users",
    "changes": [{"sql": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"}],
    "rollback": [{"sql": "DROP TABLE users"}]
  }}
]}"#,
    );
    let result = engine.validate(&master, &ChangeFilter::all()).await;
    assert!(result.is_success(), "{result:?}");
    let report = result.validation.unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.warnings.len(), 2);
    assert!(report
        .warnings
        .iter()
        .all(|w| w.contains("not present in the changelog")));
}

// =============================================================================
// Bundled sample changelog
// =============================================================================

#[tokio::test]
async fn test_sample_changelog_round_trip() {
    let master = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("db/changelog/db.changelog-master.json");
    let engine = engine(memory_pool().await).await;

    let result = engine
        .migrate(&master, &ChangeFilter::parse(Some("dev"), None))
        .await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(
        result.changesets,
        vec![
            "db.changelog-master.json::001-create-users::oxide",
            "db.changelog-posts.sql::002-create-posts::oxide",
            "db.changelog-posts.sql::004-published-posts-view::oxide",
            "db.changelog-master.json::003-seed-dev-users::oxide",
        ]
    );
    assert!(table_exists(&engine, "posts").await);

    let report = engine
        .validation_report(&master, &ChangeFilter::all())
        .await
        .unwrap();
    assert!(report.is_valid(), "{report:?}");
    assert!(report.warnings.is_empty(), "{report:?}");

    let result = engine.rollback(&master, 4).await;
    assert!(result.is_success(), "{result:?}");
    assert!(applied_ids(&engine).await.is_empty());
    assert!(!table_exists(&engine, "users").await);
}
