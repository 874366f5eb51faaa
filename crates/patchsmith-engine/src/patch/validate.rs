//! The gate every proposal passes before the filesystem is touched, whatever
//! produced it: JSON payload, interpreter output or staged tool calls.

use super::parse::{check_content, check_replacement, check_search_block, ParseError, ParseErrorKind};
use patchsmith_core::authz::{PathPolicy, PathUse, PathViolation};
use patchsmith_core::patch::PatchAction;
use patchsmith_core::ContextBundle;
use std::path::Path;

/// All path violations of one proposal, reported together.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render_violations(.violations))]
pub struct AuthorizationError {
    pub violations: Vec<PathViolation>,
}

impl AuthorizationError {
    pub fn paths(&self) -> Vec<&str> {
        self.violations.iter().map(PathViolation::path).collect()
    }
}

fn render_violations(violations: &[PathViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Content rules shared with the JSON parser, re-applied to actions that did not
/// come through it (staged tool calls).
pub fn check_quality(actions: &[PatchAction], deletion_allowed: bool) -> Result<(), ParseError> {
    if actions.is_empty() {
        return Err(ParseError::new(ParseErrorKind::EmptyArray, "no edits proposed"));
    }
    for (idx, action) in actions.iter().enumerate() {
        match action {
            PatchAction::Create { content, .. } => check_content(idx, "content", content)?,
            PatchAction::Replace {
                search_block,
                replace_block,
                ..
            } => {
                check_search_block(idx, search_block)?;
                check_replacement(idx, replace_block)?;
            }
            PatchAction::Delete { file } => {
                if !deletion_allowed {
                    return Err(ParseError::new(
                        ParseErrorKind::DisallowedDelete,
                        format!(
                            "entry {}: delete of {} but the plan does not call for deleting files",
                            idx + 1,
                            file
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Authorize every target path. Returns the actions rewritten to normalized paths.
pub fn check_paths(
    actions: Vec<PatchAction>,
    policy: &PathPolicy,
    root: &Path,
    bundle: &ContextBundle,
) -> Result<Vec<PatchAction>, AuthorizationError> {
    let mut violations = Vec::new();
    let mut out = Vec::with_capacity(actions.len());

    for action in actions {
        let usage = match &action {
            PatchAction::Create { .. } => PathUse::Create,
            PatchAction::Replace { .. } => PathUse::Modify,
            PatchAction::Delete { .. } => PathUse::Delete,
        };
        let raw = action.file().to_string();
        let exists = exists_in_workspace(root, &raw) || bundle.contains_path(&raw);
        match policy.check(&raw, usage, exists) {
            Ok(path) => out.push(with_file(action, path)),
            Err(violation) => {
                if !violations.contains(&violation) {
                    violations.push(violation);
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(out)
    } else {
        Err(AuthorizationError { violations })
    }
}

fn exists_in_workspace(root: &Path, raw: &str) -> bool {
    let relative = raw.trim().replace('\\', "/");
    if relative.is_empty() || relative.starts_with('/') {
        return false;
    }
    root.join(relative).is_file()
}

fn with_file(action: PatchAction, path: String) -> PatchAction {
    match action {
        PatchAction::Create { content, .. } => PatchAction::Create {
            file: path,
            content,
        },
        PatchAction::Replace {
            search_block,
            replace_block,
            ..
        } => PatchAction::Replace {
            file: path,
            search_block,
            replace_block,
        },
        PatchAction::Delete { .. } => PatchAction::Delete { file: path },
    }
}
