//! Failure taxonomy and the errors surfaced to callers of the runner.

use crate::builder::ladder::AttemptStep;
use chrono::{DateTime, Utc};
use patchsmith_core::patch::PatchFormat;
use patchsmith_core::ResponseMode;
use serde::Serialize;

/// How a failed attempt may be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Top-level shape is wrong (missing/mistyped array key, not an object, empty output).
    SchemaDefinition,
    /// Entries are malformed, placeholder, or an unauthorized delete.
    StructuralContent,
    /// Not parseable as the strict wire shape, but may carry usable intent.
    RecoverableSyntax,
    PathAuthorization,
    /// A search block was absent or ambiguous and policy says switch format.
    SearchBlockMiss,
    ApplyFatal,
    RollbackFailed,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::SchemaDefinition => "schema_definition",
            FailureClass::StructuralContent => "structural_content",
            FailureClass::RecoverableSyntax => "recoverable_syntax",
            FailureClass::PathAuthorization => "path_authorization",
            FailureClass::SearchBlockMiss => "search_block_miss",
            FailureClass::ApplyFatal => "apply_fatal",
            FailureClass::RollbackFailed => "rollback_failed",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureClass::ApplyFatal | FailureClass::RollbackFailed)
    }

    /// Fixable by regenerating under a schema-only prompt.
    pub fn is_schema_repairable(&self) -> bool {
        matches!(
            self,
            FailureClass::SchemaDefinition
                | FailureClass::StructuralContent
                | FailureClass::RecoverableSyntax
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One model attempt of a builder invocation, kept for the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub index: usize,
    pub step: AttemptStep,
    pub mode: ResponseMode,
    pub format: PatchFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Every failed attempt's error, one per line, in order.
pub fn summarize_history(history: &[AttemptRecord]) -> String {
    history
        .iter()
        .filter_map(|record| {
            record.error.as_ref().map(|error| {
                format!(
                    "[{}] {} ({}): {}",
                    record.index,
                    record.step.label(),
                    record.format,
                    error
                )
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// Transport or configuration failure talking to a model.
    #[error("provider error: {error:#}")]
    Provider {
        error: anyhow::Error,
        history: Vec<AttemptRecord>,
    },

    /// The tool loop's wall-clock budget expired. Nothing was applied.
    #[error("builder invocation cancelled: {reason}")]
    Cancelled {
        reason: String,
        history: Vec<AttemptRecord>,
    },

    /// The ladder was exhausted or hit a fatal apply error.
    #[error("patch apply failed ({class}) after {} attempt(s):\n{summary}", .history.len())]
    PatchApply {
        class: FailureClass,
        summary: String,
        history: Vec<AttemptRecord>,
    },

    /// Restoring the pre-apply snapshot failed; the workspace may be partially patched.
    #[error("rollback failed: {rollback_error} (apply error: {apply_error})")]
    RollbackFailed {
        apply_error: String,
        rollback_error: String,
        history: Vec<AttemptRecord>,
    },
}

impl BuilderError {
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            BuilderError::Provider { history, .. }
            | BuilderError::Cancelled { history, .. }
            | BuilderError::PatchApply { history, .. }
            | BuilderError::RollbackFailed { history, .. } => history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, step: AttemptStep, error: Option<&str>) -> AttemptRecord {
        AttemptRecord {
            index,
            step,
            mode: ResponseMode::PatchJson,
            format: PatchFormat::SearchReplace,
            class: error.map(|_| FailureClass::StructuralContent),
            error: error.map(str::to_string),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_concatenates_each_failed_attempt() {
        let history = vec![
            record(1, AttemptStep::Primary, Some("patch 1: placeholder content")),
            record(2, AttemptStep::SchemaRetry, Some("missing `patches`")),
        ];
        let summary = summarize_history(&history);
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.contains("[1] primary (search_replace): patch 1: placeholder content"));
        assert!(summary.contains("[2] schema_retry"));
    }

    #[test]
    fn test_patch_apply_error_display_counts_attempts() {
        let history = vec![record(1, AttemptStep::Primary, Some("bad"))];
        let err = BuilderError::PatchApply {
            class: FailureClass::RecoverableSyntax,
            summary: summarize_history(&history),
            history,
        };
        let text = err.to_string();
        assert!(text.starts_with("patch apply failed (recoverable_syntax) after 1 attempt(s)"));
        assert_eq!(err.history().len(), 1);
    }

    #[test]
    fn test_fatal_and_repairable_classes() {
        assert!(FailureClass::RollbackFailed.is_fatal());
        assert!(FailureClass::ApplyFatal.is_fatal());
        assert!(!FailureClass::SearchBlockMiss.is_fatal());
        assert!(FailureClass::RecoverableSyntax.is_schema_repairable());
        assert!(!FailureClass::PathAuthorization.is_schema_repairable());
    }
}
