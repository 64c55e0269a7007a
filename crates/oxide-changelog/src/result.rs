//! Operation results.

use chrono::Utc;
use serde::Serialize;

use crate::changelog::ChangeSetId;
use crate::error::MigrateError;

/// Overall outcome of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// The operation completed.
    Success,
    /// The operation stopped on an error.
    Failed,
}

/// Engine operation that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Apply pending changesets.
    Migrate,
    /// Undo applied changesets.
    Rollback,
    /// Report pending changesets.
    Status,
    /// Check the changelog against the ledger.
    Validate,
}

/// Where an operation was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// Checking arguments or loading the changelog and ledger.
    Reading,
    /// Preparing tables and acquiring or releasing the lock.
    Locking,
    /// Executing forward changesets.
    Applying,
    /// Executing inverse changesets.
    RollingBack,
}

/// Findings of a validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Problems that make the changelog unusable as is.
    pub errors: Vec<String>,
    /// Problems worth knowing about.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of one engine operation, ready to hand to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    /// Success or failure.
    pub status: Status,
    /// Operation that ran.
    pub operation: Operation,
    /// Human-readable summary.
    pub message: String,
    /// Completion time in epoch milliseconds.
    pub timestamp: i64,
    /// Changesets applied or rolled back, in execution order.
    pub changesets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contexts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_changesets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_changeset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog_file: Option<String>,
    /// Full error chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error taxonomy name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Changeset the error is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_changeset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl MigrationResult {
    fn new(status: Status, operation: Operation, message: String) -> Self {
        Self {
            status,
            operation,
            message,
            timestamp: Utc::now().timestamp_millis(),
            changesets: Vec::new(),
            contexts: None,
            labels: None,
            rollback_count: None,
            pending_changesets: None,
            next_changeset: None,
            changelog_file: None,
            error: None,
            error_kind: None,
            failed_changeset: None,
            phase: None,
            validation: None,
        }
    }

    /// Creates a successful result.
    #[must_use]
    pub fn success(operation: Operation, message: impl Into<String>) -> Self {
        Self::new(Status::Success, operation, message.into())
    }

    /// Creates a failed result describing `error`.
    #[must_use]
    pub fn failure(operation: Operation, phase: Phase, error: &MigrateError) -> Self {
        let mut result = Self::new(Status::Failed, operation, error.to_string());
        result.error = Some(error.chain());
        result.error_kind = Some(error.kind().to_string());
        result.failed_changeset = error.changeset().map(str::to_string);
        result.phase = Some(phase);
        result
    }

    /// Creates a failed validation result carrying `report`.
    #[must_use]
    pub fn invalid(report: ValidationResult) -> Self {
        let mut result = Self::new(
            Status::Failed,
            Operation::Validate,
            format!("Changelog validation failed with {} errors", report.errors.len()),
        );
        result.error = Some(report.errors.join("\n"));
        result.error_kind = Some("ValidationError".to_string());
        result.phase = Some(Phase::Reading);
        result.validation = Some(report);
        result
    }

    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Sets the affected changesets.
    #[must_use]
    pub fn with_changesets(mut self, changesets: &[ChangeSetId]) -> Self {
        self.changesets = changesets.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the context and label lists.
    #[must_use]
    pub fn with_filter(mut self, contexts: Option<String>, labels: Option<String>) -> Self {
        self.contexts = contexts;
        self.labels = labels;
        self
    }

    /// Sets the changelog file.
    #[must_use]
    pub fn with_changelog(mut self, changelog: &std::path::Path) -> Self {
        self.changelog_file = Some(changelog.display().to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_serialization() {
        let result = MigrationResult::success(Operation::Migrate, "done")
            .with_changesets(&[ChangeSetId::new("1", "a", "c.json")])
            .with_filter(Some("dev".into()), None);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["operation"], "migrate");
        assert_eq!(json["contexts"], "dev");
        assert_eq!(json["changesets"][0], "c.json::1::a");
        assert!(json.get("labels").is_none());
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_failure_carries_error_details() {
        let err = MigrateError::NoRollbackDefined("c.json::2::a".into());
        let result = MigrationResult::failure(Operation::Rollback, Phase::RollingBack, &err);
        let json = serde_json::to_value(&result).unwrap();

        assert!(!result.is_success());
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["errorKind"], "NoRollbackDefinedError");
        assert_eq!(json["failedChangeset"], "c.json::2::a");
        assert_eq!(json["phase"], "rollingBack");
        assert_eq!(json["message"], "No rollback defined for changeset 'c.json::2::a'");
    }

    #[test]
    fn test_invalid_is_failed_validation() {
        let report = ValidationResult {
            errors: vec!["Checksum mismatch for 'c.json::1::a'".into()],
            warnings: vec!["No rollback defined for changeset 'c.json::2::a'".into()],
        };
        let result = MigrationResult::invalid(report.clone());

        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.operation, Operation::Validate);
        assert_eq!(result.message, "Changelog validation failed with 1 errors");
        assert_eq!(result.error_kind.as_deref(), Some("ValidationError"));
        assert_eq!(result.phase, Some(Phase::Reading));
        assert_eq!(result.validation, Some(report));
    }
}
