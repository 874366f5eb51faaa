//! Contracts shared between the runner, its callers, and the phase-event sink.

use crate::patch::PatchFormat;
use serde::{Deserialize, Serialize};

/// How the runner asks the model for edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Tool-enabled turn; edits are staged through edit tools.
    #[default]
    ToolCalls,
    /// Raw JSON patch text in one of the two wire shapes.
    PatchJson,
    /// Unconstrained output, always reinterpreted by the secondary model.
    Freeform,
}

impl ResponseMode {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseMode::ToolCalls => "tool_calls",
            ResponseMode::PatchJson => "patch_json",
            ResponseMode::Freeform => "freeform",
        }
    }
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Optional provider features the runner may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default = "default_true")]
    pub tool_calls: bool,
    #[serde(default)]
    pub json_schema: bool,
    /// GBNF grammar-constrained sampling.
    #[serde(default)]
    pub grammar: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            tool_calls: true,
            json_schema: false,
            grammar: false,
        }
    }
}

/// What the ladder does with a match failure at apply time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFailureAction {
    /// Regenerate under `file_writes`, once.
    SwitchFormat,
    Fatal,
}

/// Classification of apply-time match failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Search block absent from the live file.
    #[serde(default = "default_switch")]
    pub search_miss: MatchFailureAction,
    /// Search block present more than once.
    #[serde(default = "default_switch")]
    pub ambiguous_match: MatchFailureAction,
}

fn default_switch() -> MatchFailureAction {
    MatchFailureAction::SwitchFormat
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            search_miss: MatchFailureAction::SwitchFormat,
            ambiguous_match: MatchFailureAction::SwitchFormat,
        }
    }
}

/// A signal that the builder needs more information instead of producing edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Repo-relative paths written or removed, in apply order.
    pub touched: Vec<String>,
}

/// Result of restoring a rollback snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RollbackOutcome {
    pub fn not_attempted() -> Self {
        Self::default()
    }

    pub fn restored() -> Self {
        Self {
            attempted: true,
            ok: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            attempted: true,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Structured side-channel events emitted while a builder invocation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    PatchApplied {
        lane: String,
        format: PatchFormat,
        touched: Vec<String>,
    },
    PatchRollback {
        lane: String,
        outcome: RollbackOutcome,
    },
    PatchRetry {
        lane: String,
        step: String,
        format: PatchFormat,
        reason: String,
    },
    PatchParseFailed {
        lane: String,
        format: PatchFormat,
        error: String,
    },
    ContextRequest {
        lane: String,
        request: ContextRequest,
    },
}

impl PhaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseEvent::PatchApplied { .. } => "patch applied",
            PhaseEvent::PatchRollback { .. } => "patch rollback",
            PhaseEvent::PatchRetry { .. } => "patch retry",
            PhaseEvent::PatchParseFailed { .. } => "patch parse failed",
            PhaseEvent::ContextRequest { .. } => "context request",
        }
    }

    pub fn lane(&self) -> &str {
        match self {
            PhaseEvent::PatchApplied { lane, .. }
            | PhaseEvent::PatchRollback { lane, .. }
            | PhaseEvent::PatchRetry { lane, .. }
            | PhaseEvent::PatchParseFailed { lane, .. }
            | PhaseEvent::ContextRequest { lane, .. } => lane,
        }
    }
}

/// Write-only sink for phase events.
pub trait PhaseLogger: Send + Sync {
    fn log(&self, event: &PhaseEvent);
}
