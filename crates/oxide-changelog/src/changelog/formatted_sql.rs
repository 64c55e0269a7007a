//! Formatted SQL changelog format.
//!
//! ```sql
//! --liquibase formatted sql
//!
//! --changeset alice:1 context:dev,test labels:core
//! --comment: create users
//! CREATE TABLE users (id INTEGER PRIMARY KEY);
//! --rollback DROP TABLE users;
//!
//! --changeset alice:2 runInTransaction:false splitStatements:false
//! CREATE TRIGGER ...;
//! --rollback empty
//! ```
//!
//! `--rollback empty` declares a rollback that does nothing. Formatted SQL
//! files cannot include other changelogs.

use std::sync::LazyLock;

use regex::Regex;

use super::{parse_list, single_statement, split_statements, Change, ChangeSet, ChangeSetId, Entry, SourceFile};
use crate::error::Result;

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--\s*(liquibase|oxide)\s+formatted\s+sql\s*$").expect("valid regex")
});

static CHANGESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--\s*changeset\s+([^:\s]+):(\S+)(.*)$").expect("valid regex")
});

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z]+):(\S+)").expect("valid regex"));

static ROLLBACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^--\s*rollback(?:\s+(.*))?$").expect("valid regex"));

static COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--\s*comment(?::\s*|\s+|$)(.*)$").expect("valid regex")
});

/// Changeset under construction.
struct Pending {
    change_set: ChangeSet,
    split: bool,
    forward: String,
    rollback: Option<String>,
}

impl Pending {
    fn finish(self, source: &SourceFile<'_>) -> Result<ChangeSet> {
        let Self {
            mut change_set,
            split,
            forward,
            rollback,
        } = self;

        let to_statements = |sql: &str| {
            if split {
                split_statements(sql)
            } else {
                single_statement(sql)
            }
        };

        let statements = to_statements(&forward);
        if statements.is_empty() {
            return Err(source.parse_error(format!(
                "changeset '{}' declares no SQL",
                change_set.identity
            )));
        }
        change_set.changes.push(Change {
            description: "sql".to_string(),
            statements,
        });

        change_set.rollback = rollback.map(|sql| {
            let statements = to_statements(&sql);
            if statements.is_empty() {
                Vec::new()
            } else {
                vec![Change {
                    description: "sql".to_string(),
                    statements,
                }]
            }
        });

        Ok(change_set)
    }
}

/// Parses a formatted SQL changelog.
pub(crate) fn parse(content: &str, source: &SourceFile<'_>) -> Result<Vec<Entry>> {
    let mut lines = content.lines().enumerate().skip_while(|(_, l)| l.trim().is_empty());

    match lines.next() {
        Some((_, first)) if HEADER.is_match(first.trim()) => {}
        _ => {
            return Err(source.parse_error(
                "formatted SQL changelog must start with '--liquibase formatted sql'",
            ))
        }
    }

    let mut entries = Vec::new();
    let mut current: Option<Pending> = None;

    for (index, line) in lines {
        let line_no = index + 1;
        let trimmed = line.trim();

        if let Some(caps) = CHANGESET.captures(trimmed) {
            if let Some(done) = current.take() {
                entries.push(Entry::ChangeSet(done.finish(source)?));
            }
            let identity = ChangeSetId::new(&caps[2], &caps[1], source.logical);
            let mut pending = Pending {
                change_set: ChangeSet::new(identity),
                split: true,
                forward: String::new(),
                rollback: None,
            };
            apply_attributes(&mut pending, &caps[3], source, line_no)?;
            current = Some(pending);
            continue;
        }

        let Some(pending) = current.as_mut() else {
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            return Err(source.parse_error(format!(
                "line {line_no}: SQL found before the first '--changeset'"
            )));
        };

        if let Some(caps) = ROLLBACK.captures(trimmed) {
            let sql = caps.get(1).map_or("", |m| m.as_str()).trim();
            let rollback = pending.rollback.get_or_insert_with(String::new);
            if !sql.eq_ignore_ascii_case("empty") {
                rollback.push_str(sql);
                rollback.push('\n');
            }
        } else if let Some(caps) = COMMENT.captures(trimmed) {
            pending.change_set.comment = Some(caps[1].trim().to_string());
        } else {
            pending.forward.push_str(line);
            pending.forward.push('\n');
        }
    }

    if let Some(done) = current.take() {
        entries.push(Entry::ChangeSet(done.finish(source)?));
    }
    Ok(entries)
}

fn apply_attributes(
    pending: &mut Pending,
    attributes: &str,
    source: &SourceFile<'_>,
    line_no: usize,
) -> Result<()> {
    for caps in ATTRIBUTE.captures_iter(attributes) {
        let (key, value) = (&caps[1], &caps[2]);
        let flag = || match value.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(source.parse_error(format!(
                "line {line_no}: attribute '{key}' expects true or false, got '{value}'"
            ))),
        };

        let change_set = &mut pending.change_set;
        match key.to_ascii_lowercase().as_str() {
            "context" | "contexts" | "contextfilter" => change_set.contexts = parse_list(value),
            "labels" => change_set.labels = parse_list(value),
            "runalways" => change_set.run_always = flag()?,
            "runonchange" => change_set.run_on_change = flag()?,
            "runintransaction" => change_set.run_in_transaction = flag()?,
            "splitstatements" => pending.split = flag()?,
            _ => {
                return Err(source.parse_error(format!(
                    "line {line_no}: unknown changeset attribute '{key}'"
                )))
            }
        }
    }
    Ok(())
}
