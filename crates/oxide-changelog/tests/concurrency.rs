//! Two engines migrating the same file database at once.

mod common;

use std::collections::HashSet;

use oxide_changelog::prelude::*;

use common::{applied_ids, engine, file_pool, formatted_sql};

fn changelog_body(count: usize) -> String {
    (1..=count)
        .map(|i| format!("--changeset ops:{i}\nCREATE TABLE t{i} (id INTEGER);\n--rollback DROP TABLE t{i};\n"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_migrate_applies_each_changeset_once() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = formatted_sql(dir.path(), "changelog.sql", &changelog_body(20));
    let database = dir.path().join("app.db");

    let first = engine(file_pool(&database).await).await;
    let second = engine(file_pool(&database).await).await;

    let first_filter = ChangeFilter::all();
    let second_filter = ChangeFilter::all();
    let (a, b) = tokio::join!(
        first.migrate(&changelog, &first_filter),
        second.migrate(&changelog, &second_filter),
    );
    assert!(a.is_success(), "{a:?}");
    assert!(b.is_success(), "{b:?}");

    // Between them the two runs applied every changeset exactly once
    let mut applied: Vec<String> = a.changesets.iter().chain(&b.changesets).cloned().collect();
    assert_eq!(applied.len(), 20);
    applied.sort();
    applied.dedup();
    assert_eq!(applied.len(), 20);

    let ids = applied_ids(&first).await;
    assert_eq!(ids.len(), 20);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 20);

    let mut conn = first.connection().await.unwrap();
    assert!(first.locks().current_holder(&mut conn).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_migrate_waits_for_held_lock() {
    let dir = tempfile::tempdir().unwrap();
    let changelog = formatted_sql(dir.path(), "changelog.sql", &changelog_body(2));
    let database = dir.path().join("app.db");

    let holder = engine(file_pool(&database).await).await;
    let waiter = MigrationEngine::new(
        file_pool(&database).await,
        common::test_config().lock_timeout(std::time::Duration::from_millis(100)),
    )
    .unwrap();

    let mut conn = holder.connection().await.unwrap();
    holder.locks().bootstrap(&mut conn).await.unwrap();
    let handle = holder
        .locks()
        .acquire(&mut conn, std::time::Duration::from_secs(1))
        .await
        .unwrap();

    let blocked = waiter.migrate(&changelog, &ChangeFilter::all()).await;
    assert_eq!(blocked.error_kind.as_deref(), Some("LockTimeoutError"));
    assert!(blocked.message.contains(handle.holder_id()));

    holder.locks().release(&mut conn, handle).await.unwrap();
    drop(conn);

    let unblocked = waiter.migrate(&changelog, &ChangeFilter::all()).await;
    assert!(unblocked.is_success(), "{unblocked:?}");
    assert_eq!(applied_ids(&holder).await, vec!["1", "2"]);
}
