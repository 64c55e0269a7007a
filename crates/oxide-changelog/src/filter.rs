//! Context and label filtering.
//!
//! A changeset runs under a filter when both its contexts and its labels
//! match. For each dimension:
//!
//! - an empty filter matches everything
//! - a changeset without entries matches everything
//! - otherwise a plain entry matches when the filter names it, and a
//!   negated entry (`!prod`) matches when the filter does not name it

use std::collections::BTreeSet;

use crate::changelog::{parse_list, ChangeSet};

/// Selects which changesets apply to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    contexts: BTreeSet<String>,
    labels: BTreeSet<String>,
}

impl ChangeFilter {
    /// Creates a filter that matches every changeset.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Builds a filter from comma separated context and label lists.
    #[must_use]
    pub fn parse(contexts: Option<&str>, labels: Option<&str>) -> Self {
        Self {
            contexts: contexts.map(parse_list).unwrap_or_default(),
            labels: labels.map(parse_list).unwrap_or_default(),
        }
    }

    /// Returns true if this filter matches everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty() && self.labels.is_empty()
    }

    /// Contexts as a comma separated list, if any.
    #[must_use]
    pub fn contexts(&self) -> Option<String> {
        join(&self.contexts)
    }

    /// Labels as a comma separated list, if any.
    #[must_use]
    pub fn labels(&self) -> Option<String> {
        join(&self.labels)
    }

    /// Returns true if the changeset should run under this filter.
    #[must_use]
    pub fn matches(&self, change_set: &ChangeSet) -> bool {
        dimension_matches(&self.contexts, &change_set.contexts)
            && dimension_matches(&self.labels, &change_set.labels)
    }
}

fn dimension_matches(selected: &BTreeSet<String>, declared: &BTreeSet<String>) -> bool {
    if selected.is_empty() || declared.is_empty() {
        return true;
    }
    declared.iter().any(|entry| match entry.strip_prefix('!') {
        Some(negated) => !selected.contains(negated),
        None => selected.contains(entry),
    })
}

fn join(set: &BTreeSet<String>) -> Option<String> {
    if set.is_empty() {
        None
    } else {
        Some(set.iter().cloned().collect::<Vec<_>>().join(","))
    }
}
