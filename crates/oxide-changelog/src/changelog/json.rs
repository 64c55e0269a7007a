//! JSON changelog format.
//!
//! ```json
//! {"databaseChangeLog": [
//!   {"changeSet": {
//!     "id": "1", "author": "alice",
//!     "context": "dev,test", "labels": "core",
//!     "comment": "create users",
//!     "runInTransaction": true,
//!     "changes": [
//!       {"sql": "CREATE TABLE users (id INTEGER PRIMARY KEY)"},
//!       {"sqlFile": {"path": "sql/seed_users.sql"}}
//!     ],
//!     "rollback": [{"sql": "DROP TABLE users"}]
//!   }},
//!   {"include": {"file": "release-2.json"}}
//! ]}
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use super::{parse_list, single_statement, split_statements, Change, ChangeSet, ChangeSetId, Entry, SourceFile};
use crate::error::{MigrateError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    database_change_log: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum RawEntry {
    ChangeSet(RawChangeSet),
    Include(RawInclude),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawChangeSet {
    id: String,
    author: String,
    #[serde(default, alias = "contexts", alias = "contextFilter")]
    context: Option<String>,
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    run_always: bool,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default = "default_true")]
    run_in_transaction: bool,
    #[serde(default)]
    changes: Vec<RawChange>,
    #[serde(default)]
    rollback: Option<Vec<RawChange>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawChange {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    sql_file: Option<RawSqlFile>,
    #[serde(default = "default_true")]
    split_statements: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSqlFile {
    path: String,
    #[serde(default = "default_true")]
    relative_to_changelog_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawInclude {
    file: String,
    #[serde(default = "default_true")]
    relative_to_changelog_file: bool,
}

fn default_true() -> bool {
    true
}

/// Parses a JSON changelog document.
pub(crate) fn parse(content: &str, source: &SourceFile<'_>) -> Result<Vec<Entry>> {
    let document: Document =
        serde_json::from_str(content).map_err(|e| source.parse_error(e.to_string()))?;

    document
        .database_change_log
        .into_iter()
        .map(|entry| match entry {
            RawEntry::ChangeSet(raw) => convert_change_set(raw, source).map(Entry::ChangeSet),
            RawEntry::Include(include) => Ok(Entry::Include(resolve(
                source,
                &include.file,
                include.relative_to_changelog_file,
            ))),
        })
        .collect()
}

fn convert_change_set(raw: RawChangeSet, source: &SourceFile<'_>) -> Result<ChangeSet> {
    if raw.id.trim().is_empty() || raw.author.trim().is_empty() {
        return Err(source.parse_error("changeSet requires a non-empty id and author"));
    }
    let identity = ChangeSetId::new(raw.id, raw.author, source.logical);

    let changes = raw
        .changes
        .into_iter()
        .map(|c| convert_change(c, source))
        .collect::<Result<Vec<_>>>()?;
    if changes.is_empty() {
        return Err(source.parse_error(format!("changeSet '{identity}' declares no changes")));
    }

    let rollback = raw
        .rollback
        .map(|changes| {
            changes
                .into_iter()
                .map(|c| convert_change(c, source))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    Ok(ChangeSet {
        identity,
        comment: raw.comment,
        changes,
        rollback,
        contexts: raw.context.as_deref().map(parse_list).unwrap_or_default(),
        labels: raw.labels.as_deref().map(parse_list).unwrap_or_default(),
        run_always: raw.run_always,
        run_on_change: raw.run_on_change,
        run_in_transaction: raw.run_in_transaction,
    })
}

fn convert_change(raw: RawChange, source: &SourceFile<'_>) -> Result<Change> {
    let split = |sql: &str| {
        if raw.split_statements {
            split_statements(sql)
        } else {
            single_statement(sql)
        }
    };

    match (&raw.sql, &raw.sql_file) {
        (Some(sql), None) => Ok(Change {
            description: "sql".to_string(),
            statements: split(sql),
        }),
        (None, Some(file)) => {
            let path = resolve(source, &file.path, file.relative_to_changelog_file);
            let sql = std::fs::read_to_string(&path).map_err(|source| MigrateError::ChangelogRead {
                path: path.clone(),
                source,
            })?;
            Ok(Change {
                description: format!("sqlFile {}", file.path),
                statements: split(&sql),
            })
        }
        _ => Err(source.parse_error("each change needs exactly one of 'sql' or 'sqlFile'")),
    }
}

fn resolve(source: &SourceFile<'_>, file: &str, relative_to_changelog: bool) -> PathBuf {
    if relative_to_changelog {
        source.dir().join(file)
    } else {
        source.root_dir.join(file)
    }
}
