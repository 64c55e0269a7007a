//! Integration tests for the request router.

mod common;

use std::sync::Arc;

use oxide_changelog::api::SERVICE_NAME;
use oxide_changelog::prelude::*;

use common::{engine, formatted_sql, memory_pool};

async fn api(dir: &std::path::Path) -> MigrationApi {
    let changelog = formatted_sql(
        dir,
        "changelog.sql",
        "\
--changeset ops:1 context:dev
CREATE TABLE dev_data (id INTEGER);
--rollback DROP TABLE dev_data;
--changeset ops:2
CREATE TABLE shared (id INTEGER);
--rollback DROP TABLE shared;
",
    );
    MigrationApi::new(Arc::new(engine(memory_pool().await).await), changelog)
}

#[tokio::test]
async fn test_run_then_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(dir.path()).await;

    let run = api.handle("POST", "/api/v1/migration/run?contexts=prod").await;
    assert_eq!(run.status, 200);
    assert_eq!(run.body["status"], "SUCCESS");
    assert_eq!(run.body["contexts"], "prod");
    assert_eq!(run.body["changesets"].as_array().unwrap().len(), 1);

    let status = api.handle("GET", "/api/v1/migration/status").await;
    assert_eq!(status.body["pendingChangesets"], 1);
    assert_eq!(status.body["nextChangeset"], "changelog.sql::1::ops");

    let rollback = api
        .handle("POST", "/api/v1/migration/rollback?count=5")
        .await;
    assert_eq!(rollback.status, 200);
    assert_eq!(rollback.body["rollbackCount"], 1);
}

#[tokio::test]
async fn test_bad_count_never_reaches_engine() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(dir.path()).await;

    let response = api
        .handle("POST", "/api/v1/migration/rollback?count=0")
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.body["message"], "Count must be a positive integer");

    let mut conn = api.engine().connection().await.unwrap();
    assert!(!api.engine().ledger().is_bootstrapped(&mut conn).await.unwrap());
}

#[tokio::test]
async fn test_validate_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let api = api(dir.path()).await;

    let validate = api.handle("GET", "/api/v1/migration/validate").await;
    assert_eq!(validate.status, 200);
    assert_eq!(validate.body["operation"], "validate");
    assert!(validate.body["validation"]["errors"]
        .as_array()
        .unwrap()
        .is_empty());

    let health = api.handle("GET", "/api/v1/migration/health").await;
    assert_eq!(health.status, 200);
    assert_eq!(health.body["service"], SERVICE_NAME);

    assert_eq!(api.handle("DELETE", "/api/v1/migration/health").await.status, 405);
    assert_eq!(api.handle("GET", "/").await.status, 404);
}
