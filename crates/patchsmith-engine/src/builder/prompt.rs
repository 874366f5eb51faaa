//! User-prompt assembly for the builder role.

use super::history::LaneTurn;
use crate::llm::prompts::{builder_system, format_repair_guidance, schema_only_system};
use crate::llm::ChatMessage;
use crate::patch::validate::AuthorizationError;
use patchsmith_core::authz::{PathPolicy, PathViolation};
use patchsmith_core::patch::PatchFormat;
use patchsmith_core::{ContextBundle, Plan, ResponseMode};

const MAX_HISTORY_TURNS: usize = 6;

pub(crate) fn user_prompt(
    intent: &str,
    plan: &Plan,
    bundle: &ContextBundle,
    policy: &PathPolicy,
    turns: &[LaneTurn],
) -> String {
    let mut out = String::new();

    if !turns.is_empty() {
        out.push_str("EARLIER IN THIS LANE:\n");
        let skip = turns.len().saturating_sub(MAX_HISTORY_TURNS);
        for turn in turns.iter().skip(skip) {
            out.push_str(&format!("- {} => {}\n", turn.intent, turn.summary));
        }
        out.push('\n');
    }

    out.push_str(&format!("INTENT:\n{}\n\n", intent.trim()));

    out.push_str("PLAN:\n");
    for (idx, step) in plan.steps.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", idx + 1, step));
    }
    if !plan.risk_assessment.trim().is_empty() {
        out.push_str(&format!("\nRISKS:\n{}\n", plan.risk_assessment.trim()));
    }
    if !plan.verification.is_empty() {
        out.push_str("\nVERIFICATION:\n");
        for check in &plan.verification {
            out.push_str(&format!("- {}\n", check));
        }
    }

    out.push_str(&format!("\n{}", path_rules(policy)));

    let context = bundle.render();
    if !context.trim().is_empty() {
        out.push_str(&format!("\nCONTEXT:\n{}\n", context.trim_end()));
    }
    out
}

fn path_rules(policy: &PathPolicy) -> String {
    let mut out = String::from("EDITABLE FILES:\n");
    if policy.allowed_paths().is_empty() {
        out.push_str("(none)\n");
    }
    for path in policy.allowed_paths() {
        out.push_str(&format!("- {}\n", path));
    }
    if !policy.creatable_paths().is_empty() {
        out.push_str("\nFILES YOU MAY CREATE:\n");
        for path in policy.creatable_paths() {
            out.push_str(&format!("- {}\n", path));
        }
    }
    if !policy.read_only_paths().is_empty() {
        out.push_str("\nREAD-ONLY (never edit):\n");
        for path in policy.read_only_paths() {
            out.push_str(&format!("- {}\n", path));
        }
    }
    out
}

/// First request of an invocation.
pub(crate) fn initial_messages(
    mode: ResponseMode,
    format: PatchFormat,
    user: &str,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(builder_system(mode, format)),
        ChatMessage::user(user),
    ]
}

/// Schema-only regeneration, carrying the previous error as repair guidance.
pub(crate) fn schema_only_messages(
    format: PatchFormat,
    user: &str,
    previous_error: &str,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(schema_only_system(format)),
        ChatMessage::user(format!(
            "{}\n\n{}",
            user,
            format_repair_guidance(previous_error, format)
        )),
    ]
}

/// Regeneration after path violations: what was refused and what is allowed.
pub(crate) fn guard_messages(
    format: PatchFormat,
    user: &str,
    err: &AuthorizationError,
    policy: &PathPolicy,
) -> Vec<ChatMessage> {
    let mut guard = String::from("IMPORTANT: Your previous payload targeted disallowed files:\n");
    for violation in &err.violations {
        let reason = match violation {
            PathViolation::ReadOnly { rule, .. } => format!("read-only ({})", rule),
            PathViolation::NotAllowed(_) => "not in the editable set".to_string(),
            PathViolation::CreateNotPermitted(_) => "not listed for creation".to_string(),
            PathViolation::Placeholder(_) => "unresolved placeholder path".to_string(),
            PathViolation::Absolute(_) => "absolute path".to_string(),
            PathViolation::Traversal(_) => "escapes the workspace".to_string(),
            PathViolation::Empty => "empty path".to_string(),
        };
        let path = if violation.path().is_empty() {
            "(empty)"
        } else {
            violation.path()
        };
        guard.push_str(&format!("- {}: {}\n", path, reason));
    }
    guard.push_str("\nOnly edit these paths:\n");
    for path in policy.allowed_paths() {
        guard.push_str(&format!("- {}\n", path));
    }
    if !policy.read_only_paths().is_empty() {
        guard.push_str("\nNever edit anything under:\n");
        for path in policy.read_only_paths() {
            guard.push_str(&format!("- {}\n", path));
        }
    }

    vec![
        ChatMessage::system(schema_only_system(format)),
        ChatMessage::user(format!("{}\n\n{}", user, guard)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prompt_lists_paths_and_history() {
        let plan = Plan {
            steps: vec!["Add a cache".to_string()],
            target_files: vec!["src/lib.rs".to_string()],
            ..Plan::default()
        };
        let bundle = ContextBundle {
            read_only_paths: vec!["docs".to_string()],
            rendered: "--- src/lib.rs ---\npub fn f() {}\n".to_string(),
            ..ContextBundle::default()
        };
        let policy = PathPolicy::new(&plan, &bundle);
        let turns = vec![LaneTurn {
            intent: "earlier".to_string(),
            summary: "did a thing".to_string(),
        }];
        let prompt = user_prompt("make it fast", &plan, &bundle, &policy, &turns);
        assert!(prompt.starts_with("EARLIER IN THIS LANE:\n- earlier => did a thing"));
        assert!(prompt.contains("1. Add a cache"));
        assert!(prompt.contains("EDITABLE FILES:\n- src/lib.rs"));
        assert!(prompt.contains("READ-ONLY (never edit):\n- docs"));
        assert!(prompt.contains("pub fn f() {}"));
    }

    #[test]
    fn test_guard_prompt_names_violations_and_allowed_paths() {
        let plan = Plan {
            target_files: vec!["src/lib.rs".to_string()],
            ..Plan::default()
        };
        let bundle = ContextBundle {
            read_only_paths: vec!["docs".to_string()],
            ..ContextBundle::default()
        };
        let policy = PathPolicy::new(&plan, &bundle);
        let err = AuthorizationError {
            violations: vec![PathViolation::ReadOnly {
                path: "docs/guide.md".to_string(),
                rule: "docs".to_string(),
            }],
        };
        let messages = guard_messages(PatchFormat::SearchReplace, "u", &err, &policy);
        let user = messages[1].content.clone().unwrap_or_default();
        assert!(user.contains("- docs/guide.md: read-only (docs)"));
        assert!(user.contains("Only edit these paths:\n- src/lib.rs"));
    }
}
