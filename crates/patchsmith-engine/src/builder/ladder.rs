//! The recovery ladder: an explicit state machine over failed attempts.
//!
//! Each rung is bounded (format switch once, schema retry once per format,
//! fallback once, guard once, interpreter once), so every run terminates.

use crate::error::FailureClass;
use patchsmith_core::patch::PatchFormat;
use serde::Serialize;

/// Which rung produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStep {
    /// Edits staged through tool calls, or a payload returned from the tool turn.
    ToolTurn,
    Primary,
    /// Search block missed; regenerate as full-file writes.
    FileWritesRecovery,
    SchemaRetry,
    /// File writes still failing; one last try in search/replace.
    FormatFallback,
    /// Regenerate after disallowed paths, listing what is allowed.
    GuardRetry,
    Interpreter,
    Freeform,
}

impl AttemptStep {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptStep::ToolTurn => "tool_turn",
            AttemptStep::Primary => "primary",
            AttemptStep::FileWritesRecovery => "file_writes_recovery",
            AttemptStep::SchemaRetry => "schema_retry",
            AttemptStep::FormatFallback => "format_fallback",
            AttemptStep::GuardRetry => "guard_retry",
            AttemptStep::Interpreter => "interpreter",
            AttemptStep::Freeform => "freeform",
        }
    }
}

impl std::fmt::Display for AttemptStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What the runner does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    /// Ask the builder model again, schema-only, in `format`.
    Regenerate { step: AttemptStep, format: PatchFormat },
    /// Hand the last raw output to the interpreter.
    Interpret { format: PatchFormat },
    /// No rung left for this failure.
    Exhausted,
    /// The failure is not recoverable.
    Fatal,
}

/// The facts about a failed attempt the ladder decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureFacts {
    pub class: FailureClass,
    pub format: PatchFormat,
    pub interpreter_eligible: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetryLadder {
    switched_to_file_writes: bool,
    schema_retried_search_replace: bool,
    schema_retried_file_writes: bool,
    fallback_used: bool,
    guard_used: bool,
    interpreter_used: bool,
}

impl RetryLadder {
    pub fn new() -> Self {
        Self::default()
    }

    fn schema_retried(&mut self, format: PatchFormat) -> &mut bool {
        match format {
            PatchFormat::SearchReplace => &mut self.schema_retried_search_replace,
            PatchFormat::FileWrites => &mut self.schema_retried_file_writes,
        }
    }

    /// Consume the rung that handles `facts`, if one is left.
    pub fn next(&mut self, facts: &FailureFacts) -> LadderState {
        if facts.class.is_fatal() {
            return LadderState::Fatal;
        }
        if facts.class.is_schema_repairable() {
            return self.next_schema_repair(facts);
        }
        match facts.class {
            FailureClass::SearchBlockMiss
                if facts.format == PatchFormat::SearchReplace && !self.switched_to_file_writes =>
            {
                self.switched_to_file_writes = true;
                LadderState::Regenerate {
                    step: AttemptStep::FileWritesRecovery,
                    format: PatchFormat::FileWrites,
                }
            }
            FailureClass::PathAuthorization if !self.guard_used => {
                self.guard_used = true;
                LadderState::Regenerate {
                    step: AttemptStep::GuardRetry,
                    format: facts.format,
                }
            }
            _ => LadderState::Exhausted,
        }
    }

    fn next_schema_repair(&mut self, facts: &FailureFacts) -> LadderState {
        let retried = self.schema_retried(facts.format);
        if !*retried {
            *retried = true;
            return LadderState::Regenerate {
                step: AttemptStep::SchemaRetry,
                format: facts.format,
            };
        }
        if facts.format == PatchFormat::FileWrites && !self.fallback_used {
            self.fallback_used = true;
            return LadderState::Regenerate {
                step: AttemptStep::FormatFallback,
                format: PatchFormat::SearchReplace,
            };
        }
        if facts.class == FailureClass::RecoverableSyntax
            && facts.interpreter_eligible
            && !self.interpreter_used
        {
            self.interpreter_used = true;
            return LadderState::Interpret {
                format: facts.format,
            };
        }
        LadderState::Exhausted
    }

    /// Mark the interpreter as spent without going through `next` (freeform mode).
    pub fn consume_interpreter(&mut self) {
        self.interpreter_used = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(class: FailureClass, format: PatchFormat) -> FailureFacts {
        FailureFacts {
            class,
            format,
            interpreter_eligible: true,
        }
    }

    #[test]
    fn test_search_miss_switches_format_once() {
        let mut ladder = RetryLadder::new();
        let miss = facts(FailureClass::SearchBlockMiss, PatchFormat::SearchReplace);
        assert_eq!(
            ladder.next(&miss),
            LadderState::Regenerate {
                step: AttemptStep::FileWritesRecovery,
                format: PatchFormat::FileWrites,
            }
        );
        assert_eq!(ladder.next(&miss), LadderState::Exhausted);
    }

    #[test]
    fn test_schema_retry_once_per_format_then_fallback_then_interpreter() {
        let mut ladder = RetryLadder::new();
        let fw = facts(FailureClass::RecoverableSyntax, PatchFormat::FileWrites);
        assert_eq!(
            ladder.next(&fw),
            LadderState::Regenerate {
                step: AttemptStep::SchemaRetry,
                format: PatchFormat::FileWrites,
            }
        );
        assert_eq!(
            ladder.next(&fw),
            LadderState::Regenerate {
                step: AttemptStep::FormatFallback,
                format: PatchFormat::SearchReplace,
            }
        );
        let sr = facts(FailureClass::RecoverableSyntax, PatchFormat::SearchReplace);
        assert_eq!(
            ladder.next(&sr),
            LadderState::Regenerate {
                step: AttemptStep::SchemaRetry,
                format: PatchFormat::SearchReplace,
            }
        );
        assert_eq!(
            ladder.next(&sr),
            LadderState::Interpret {
                format: PatchFormat::SearchReplace
            }
        );
        assert_eq!(ladder.next(&sr), LadderState::Exhausted);
    }

    #[test]
    fn test_guard_retry_once_and_fatal_classes() {
        let mut ladder = RetryLadder::new();
        let denied = facts(FailureClass::PathAuthorization, PatchFormat::SearchReplace);
        assert!(matches!(
            ladder.next(&denied),
            LadderState::Regenerate {
                step: AttemptStep::GuardRetry,
                ..
            }
        ));
        assert_eq!(ladder.next(&denied), LadderState::Exhausted);
        assert_eq!(
            ladder.next(&facts(FailureClass::ApplyFatal, PatchFormat::FileWrites)),
            LadderState::Fatal
        );
        assert_eq!(
            ladder.next(&facts(FailureClass::RollbackFailed, PatchFormat::SearchReplace)),
            LadderState::Fatal
        );
    }

    #[test]
    fn test_structural_failures_never_reach_interpreter() {
        let mut ladder = RetryLadder::new();
        let structural = facts(FailureClass::StructuralContent, PatchFormat::SearchReplace);
        ladder.next(&structural);
        assert_eq!(ladder.next(&structural), LadderState::Exhausted);
    }

    #[test]
    fn test_ladder_always_terminates() {
        let classes = [
            FailureClass::SchemaDefinition,
            FailureClass::StructuralContent,
            FailureClass::RecoverableSyntax,
            FailureClass::PathAuthorization,
            FailureClass::SearchBlockMiss,
        ];
        let mut ladder = RetryLadder::new();
        let mut format = PatchFormat::SearchReplace;
        let mut steps = 0;
        loop {
            let class = classes[steps % classes.len()];
            match ladder.next(&facts(class, format)) {
                LadderState::Regenerate { format: next, .. } | LadderState::Interpret { format: next } => {
                    format = next;
                    steps += 1;
                    assert!(steps < 16, "ladder did not terminate");
                }
                LadderState::Exhausted | LadderState::Fatal => break,
            }
        }
    }
}
