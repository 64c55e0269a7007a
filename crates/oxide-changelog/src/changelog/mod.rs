//! Changelog loading.
//!
//! A changelog is an ordered list of [`ChangeSet`]s, possibly spread over
//! several files through includes. Loading resolves includes depth-first,
//! keeps changesets in order of appearance, and rejects duplicate
//! identities and include cycles.
//!
//! Two source formats are understood, chosen by file extension:
//!
//! - `.json` - a `databaseChangeLog` document (see [`json`])
//! - `.sql` - formatted SQL with `--changeset author:id` markers (see [`formatted_sql`])

pub mod formatted_sql;
pub mod json;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum;
use crate::error::{MigrateError, Result};

/// Unique identity of a changeset: author, id and the logical path of the
/// file declaring it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetId {
    /// Changeset id as written in the changelog.
    pub id: String,
    /// Changeset author.
    pub author: String,
    /// Declaring file, relative to the root changelog's directory.
    pub path: String,
}

impl ChangeSetId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// One executable change: a description plus the SQL statements it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Short description, e.g. `sql` or `sqlFile seed.sql`.
    pub description: String,
    /// Statements, executed in order.
    pub statements: Vec<String>,
}

impl Change {
    /// Creates a change from inline SQL, splitting it into statements.
    #[must_use]
    pub fn sql(sql: &str) -> Self {
        Self {
            description: "sql".to_string(),
            statements: split_statements(sql),
        }
    }
}

/// An identified unit of database change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Identity.
    pub identity: ChangeSetId,
    /// Free-form comment.
    pub comment: Option<String>,
    /// Forward changes.
    pub changes: Vec<Change>,
    /// Inverse changes. `None` means no rollback is declared; an empty list
    /// is an explicit no-op rollback.
    pub rollback: Option<Vec<Change>>,
    /// Contexts this changeset applies to (lowercase, `!` prefix negates).
    pub contexts: BTreeSet<String>,
    /// Labels attached to this changeset (lowercase, `!` prefix negates).
    pub labels: BTreeSet<String>,
    /// Execute on every migrate, even when already applied.
    pub run_always: bool,
    /// Execute again whenever the checksum changes.
    pub run_on_change: bool,
    /// Wrap execution and the ledger write in a single transaction.
    pub run_in_transaction: bool,
}

impl ChangeSet {
    /// Creates a changeset with no changes and default flags.
    #[must_use]
    pub fn new(identity: ChangeSetId) -> Self {
        Self {
            identity,
            comment: None,
            changes: Vec::new(),
            rollback: None,
            contexts: BTreeSet::new(),
            labels: BTreeSet::new(),
            run_always: false,
            run_on_change: false,
            run_in_transaction: true,
        }
    }

    /// Adds a forward change.
    #[must_use]
    pub fn change(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    /// Adds an inverse change.
    #[must_use]
    pub fn rollback_change(mut self, change: Change) -> Self {
        self.rollback.get_or_insert_with(Vec::new).push(change);
        self
    }

    /// Sets the contexts.
    #[must_use]
    pub fn contexts(mut self, contexts: &str) -> Self {
        self.contexts = parse_list(contexts);
        self
    }

    /// Sets the labels.
    #[must_use]
    pub fn labels(mut self, labels: &str) -> Self {
        self.labels = parse_list(labels);
        self
    }

    /// Forward statements in execution order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .flat_map(|c| c.statements.iter().map(String::as_str))
    }

    /// Inverse statements in execution order, if a rollback is declared.
    #[must_use]
    pub fn rollback_statements(&self) -> Option<Vec<&str>> {
        self.rollback.as_ref().map(|changes| {
            changes
                .iter()
                .flat_map(|c| c.statements.iter().map(String::as_str))
                .collect()
        })
    }

    /// Checksum of the forward statements.
    #[must_use]
    pub fn checksum(&self) -> String {
        checksum::compute(self.statements())
    }

    /// Description recorded in the ledger: the comment, or the change descriptions.
    #[must_use]
    pub fn description(&self) -> String {
        match &self.comment {
            Some(comment) => comment.clone(),
            None => self
                .changes
                .iter()
                .map(|c| c.description.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// A fully loaded changelog.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    /// Path the changelog was loaded from.
    pub source: PathBuf,
    /// Changesets in order of appearance.
    pub change_sets: Vec<ChangeSet>,
}

impl ChangeLog {
    /// Loads a changelog and every file it includes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let root_dir = normalize(path.parent().unwrap_or_else(|| Path::new("")));
        let mut loader = Loader {
            root_dir,
            stack: Vec::new(),
            seen: HashSet::new(),
            change_sets: Vec::new(),
        };
        loader.load_file(path)?;
        debug!(
            changelog = %path.display(),
            change_sets = loader.change_sets.len(),
            "Loaded changelog"
        );
        Ok(Self {
            source: path.to_path_buf(),
            change_sets: loader.change_sets,
        })
    }

    /// Looks up a changeset by identity.
    #[must_use]
    pub fn get(&self, identity: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| &cs.identity == identity)
    }

    /// Iterates changesets in changelog order.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeSet> {
        self.change_sets.iter()
    }

    /// Number of changesets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    /// Returns true if the changelog declares no changesets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }
}

/// An entry produced by a format parser.
#[derive(Debug)]
pub(crate) enum Entry {
    ChangeSet(ChangeSet),
    Include(PathBuf),
}

/// The file currently being parsed.
pub(crate) struct SourceFile<'a> {
    /// Path on disk.
    pub path: &'a Path,
    /// Logical path used in identities.
    pub logical: &'a str,
    /// Directory of the root changelog.
    pub root_dir: &'a Path,
}

impl SourceFile<'_> {
    /// Directory containing this file.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn parse_error(&self, message: impl Into<String>) -> MigrateError {
        MigrateError::Parse {
            path: self.path.to_path_buf(),
            message: message.into(),
        }
    }
}

struct Loader {
    root_dir: PathBuf,
    stack: Vec<PathBuf>,
    seen: HashSet<ChangeSetId>,
    change_sets: Vec<ChangeSet>,
}

impl Loader {
    fn load_file(&mut self, path: &Path) -> Result<()> {
        let canonical = path
            .canonicalize()
            .map_err(|source| MigrateError::ChangelogRead {
                path: path.to_path_buf(),
                source,
            })?;

        if self.stack.contains(&canonical) {
            let mut chain = self.stack.clone();
            chain.push(canonical);
            return Err(MigrateError::CircularInclude { chain });
        }

        let content = std::fs::read_to_string(path).map_err(|source| MigrateError::ChangelogRead {
            path: path.to_path_buf(),
            source,
        })?;

        let logical = logical_path(&self.root_dir, path);
        let source = SourceFile {
            path,
            logical: &logical,
            root_dir: &self.root_dir,
        };

        let entries = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => json::parse(&content, &source)?,
            Some(ext) if ext.eq_ignore_ascii_case("sql") => formatted_sql::parse(&content, &source)?,
            _ => {
                return Err(source.parse_error(
                    "unsupported changelog format (expected .json or .sql)",
                ))
            }
        };

        self.stack.push(canonical);
        for entry in entries {
            match entry {
                Entry::ChangeSet(change_set) => {
                    if !self.seen.insert(change_set.identity.clone()) {
                        return Err(MigrateError::DuplicateChangeSet(
                            change_set.identity.to_string(),
                        ));
                    }
                    self.change_sets.push(change_set);
                }
                Entry::Include(included) => {
                    debug!(include = %included.display(), "Including changelog");
                    self.load_file(&included)?;
                }
            }
        }
        self.stack.pop();
        Ok(())
    }
}

/// Splits SQL into statements on `;` at end of line, dropping empty and
/// comment-only statements.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim_end();
        if let Some(body) = trimmed.strip_suffix(';') {
            current.push_str(body);
            push_statement(&mut statements, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    let has_code = statement
        .lines()
        .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with("--"));
    if has_code {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Wraps a whole SQL text as one statement, for `splitStatements: false`.
pub(crate) fn single_statement(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = sql.to_string();
    push_statement(&mut statements, &mut current);
    statements
}

/// Parses a comma separated context or label list.
pub(crate) fn parse_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Lexically resolves `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn logical_path(root_dir: &Path, path: &Path) -> String {
    let normalized = normalize(path);
    let relative = normalized.strip_prefix(root_dir).unwrap_or(&normalized);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
