//! Validate-then-apply against the workspace.
//!
//! Every action is resolved and replayed in memory first; the disk is only
//! touched once the whole batch is known to apply. Writes are then preceded by a
//! snapshot of each touched path, and any I/O failure mid-batch restores that
//! snapshot. This is snapshot plus restore, not a filesystem transaction: a
//! crash between two writes leaves the workspace partially patched.

use crate::error::FailureClass;
use patchsmith_adapters::util::resolve_workspace_path;
use patchsmith_core::patch::PatchAction;
use patchsmith_core::{ApplyReport, MatchFailureAction, RecoveryPolicy, RollbackOutcome};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid path {path}: {reason}")]
    Path { path: String, reason: String },
    #[error("cannot {action} {path}: file does not exist")]
    MissingFile { path: String, action: &'static str },
    #[error("search block not found in {path}")]
    SearchBlockNotFound { path: String },
    #[error("search block matches {count} times in {path} (must be unique)")]
    AmbiguousSearch { path: String, count: usize },
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Map an apply error onto the recovery ladder, honoring the match-failure policy.
pub fn classify_apply_error(err: &ApplyError, policy: &RecoveryPolicy) -> FailureClass {
    let action = match err {
        ApplyError::SearchBlockNotFound { .. } => policy.search_miss,
        ApplyError::AmbiguousSearch { .. } => policy.ambiguous_match,
        _ => return FailureClass::ApplyFatal,
    };
    match action {
        MatchFailureAction::SwitchFormat => FailureClass::SearchBlockMiss,
        MatchFailureAction::Fatal => FailureClass::ApplyFatal,
    }
}

/// An apply that did not complete, with what happened to the snapshot.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApplyFailure {
    #[source]
    pub error: ApplyError,
    pub rollback: RollbackOutcome,
}

impl ApplyFailure {
    fn before_write(error: ApplyError) -> Self {
        Self {
            error,
            rollback: RollbackOutcome::not_attempted(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteOp {
    Write { content: String },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedWrite {
    relative: String,
    absolute: PathBuf,
    op: WriteOp,
}

/// The net effect of a batch, computed without touching the disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedWrites {
    writes: Vec<PlannedWrite>,
}

impl PreparedWrites {
    pub fn paths(&self) -> Vec<&str> {
        self.writes.iter().map(|w| w.relative.as_str()).collect()
    }
}

struct FileState {
    absolute: PathBuf,
    original: Option<String>,
    current: Option<String>,
}

fn resolve(root: &Path, file: &str) -> Result<(String, PathBuf), ApplyError> {
    let resolved =
        resolve_workspace_path(root, Path::new(file)).map_err(|reason| ApplyError::Path {
            path: file.to_string(),
            reason,
        })?;
    Ok((resolved.display_relative(), resolved.absolute))
}

fn read_existing(relative: &str, absolute: &Path) -> Result<Option<String>, ApplyError> {
    if !absolute.is_file() {
        return Ok(None);
    }
    fs::read_to_string(absolute)
        .map(Some)
        .map_err(|source| ApplyError::Io {
            path: relative.to_string(),
            source,
        })
}

/// Replay every action in memory. Fails on the first action that cannot apply,
/// before anything is written.
pub fn prepare(root: &Path, actions: &[PatchAction]) -> Result<PreparedWrites, ApplyError> {
    let mut order: Vec<String> = Vec::new();
    let mut states: HashMap<String, FileState> = HashMap::new();

    for action in actions {
        let (relative, absolute) = resolve(root, action.file())?;
        if !states.contains_key(&relative) {
            let original = read_existing(&relative, &absolute)?;
            order.push(relative.clone());
            states.insert(
                relative.clone(),
                FileState {
                    absolute,
                    current: original.clone(),
                    original,
                },
            );
        }
        let Some(state) = states.get_mut(&relative) else {
            continue;
        };

        match action {
            PatchAction::Create { content, .. } => state.current = Some(content.clone()),
            PatchAction::Replace {
                search_block,
                replace_block,
                ..
            } => {
                let Some(current) = state.current.as_deref() else {
                    return Err(ApplyError::MissingFile {
                        path: relative,
                        action: "replace in",
                    });
                };
                let updated = replace_unique(current, search_block, replace_block, &relative)?;
                state.current = Some(updated);
            }
            PatchAction::Delete { .. } => {
                if state.current.is_none() {
                    return Err(ApplyError::MissingFile {
                        path: relative,
                        action: "delete",
                    });
                }
                state.current = None;
            }
        }
    }

    let mut writes = Vec::new();
    for relative in order {
        let Some(state) = states.remove(&relative) else {
            continue;
        };
        if state.current == state.original {
            continue;
        }
        let op = match state.current {
            Some(content) => WriteOp::Write { content },
            None => WriteOp::Remove,
        };
        writes.push(PlannedWrite {
            relative,
            absolute: state.absolute,
            op,
        });
    }
    Ok(PreparedWrites { writes })
}

enum MatchRange {
    None,
    One { start: usize, end: usize },
    Many(usize),
}

fn find_unique_match_range(haystack: &str, needle: &str) -> MatchRange {
    let mut matches = haystack.match_indices(needle);
    let Some((start, _)) = matches.next() else {
        return MatchRange::None;
    };
    let extra = matches.count();
    if extra == 0 {
        MatchRange::One {
            start,
            end: start + needle.len(),
        }
    } else {
        MatchRange::Many(extra + 1)
    }
}

/// Exact unique match first, then the same anchor with CRLF line endings, then
/// the anchor with boundary whitespace trimmed.
fn replace_unique(
    content: &str,
    search: &str,
    replace: &str,
    path: &str,
) -> Result<String, ApplyError> {
    let splice = |start: usize, end: usize, replacement: &str| {
        let mut out = content.to_string();
        out.replace_range(start..end, replacement);
        out
    };
    let ambiguous = |count| ApplyError::AmbiguousSearch {
        path: path.to_string(),
        count,
    };

    match find_unique_match_range(content, search) {
        MatchRange::One { start, end } => return Ok(splice(start, end, replace)),
        MatchRange::Many(count) => return Err(ambiguous(count)),
        MatchRange::None => {}
    }

    if search.contains('\n') && !search.contains("\r\n") && content.contains("\r\n") {
        let crlf_search = search.replace('\n', "\r\n");
        match find_unique_match_range(content, &crlf_search) {
            MatchRange::One { start, end } => {
                return Ok(splice(start, end, &replace.replace('\n', "\r\n")))
            }
            MatchRange::Many(count) => return Err(ambiguous(count)),
            MatchRange::None => {}
        }
    }

    let trimmed = search.trim();
    if !trimmed.is_empty() && trimmed != search {
        match find_unique_match_range(content, trimmed) {
            MatchRange::One { start, end } => return Ok(splice(start, end, replace.trim())),
            MatchRange::Many(count) => return Err(ambiguous(count)),
            MatchRange::None => {}
        }
    }

    Err(ApplyError::SearchBlockNotFound {
        path: path.to_string(),
    })
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    relative: String,
    absolute: PathBuf,
    original: Option<Vec<u8>>,
}

/// Pre-write snapshot of every path a batch touches.
#[derive(Debug, Clone, Default)]
pub struct RollbackPlan {
    entries: Vec<SnapshotEntry>,
    /// Directories the batch will create, deepest first.
    created_dirs: Vec<PathBuf>,
}

impl RollbackPlan {
    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.relative.as_str()).collect()
    }
}

/// Snapshot the current bytes of every target of `actions`.
pub fn create_rollback(root: &Path, actions: &[PatchAction]) -> Result<RollbackPlan, ApplyError> {
    let root_canon = root.canonicalize().map_err(|source| ApplyError::Io {
        path: root.display().to_string(),
        source,
    })?;
    let mut plan = RollbackPlan::default();

    for action in actions {
        let (relative, absolute) = resolve(root, action.file())?;
        if plan.entries.iter().any(|e| e.relative == relative) {
            continue;
        }
        let original = if absolute.is_file() {
            Some(fs::read(&absolute).map_err(|source| ApplyError::Io {
                path: relative.clone(),
                source,
            })?)
        } else {
            None
        };

        let mut dir = absolute.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current.exists() || !current.starts_with(&root_canon) || current == root_canon {
                break;
            }
            if !plan.created_dirs.contains(&current) {
                plan.created_dirs.push(current.clone());
            }
            dir = current.parent().map(Path::to_path_buf);
        }

        plan.entries.push(SnapshotEntry {
            relative,
            absolute,
            original,
        });
    }

    plan.created_dirs
        .sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    Ok(plan)
}

/// Restore a snapshot: rewrite original bytes, remove files that did not exist,
/// then remove directories the batch created if they are empty.
pub fn rollback(plan: &RollbackPlan) -> RollbackOutcome {
    let mut errors = Vec::new();

    for entry in plan.entries.iter().rev() {
        let result = match &entry.original {
            Some(bytes) => entry
                .absolute
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::write(&entry.absolute, bytes)),
            None if entry.absolute.exists() || entry.absolute.is_symlink() => {
                fs::remove_file(&entry.absolute)
            }
            None => Ok(()),
        };
        if let Err(err) = result {
            errors.push(format!("{}: {}", entry.relative, err));
        }
    }

    for dir in &plan.created_dirs {
        let _ = fs::remove_dir(dir);
    }

    if errors.is_empty() {
        RollbackOutcome::restored()
    } else {
        RollbackOutcome::failed(errors.join("; "))
    }
}

fn write_one(write: &PlannedWrite) -> io::Result<()> {
    match &write.op {
        WriteOp::Write { content } => {
            if let Some(parent) = write.absolute.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&write.absolute, content)
        }
        WriteOp::Remove => fs::remove_file(&write.absolute),
    }
}

/// Prepare, snapshot, then write. On a write failure the snapshot is restored
/// and the outcome of that restore is returned alongside the error.
pub fn apply(root: &Path, actions: &[PatchAction]) -> Result<ApplyReport, ApplyFailure> {
    let prepared = prepare(root, actions).map_err(ApplyFailure::before_write)?;
    let snapshot = create_rollback(root, actions).map_err(ApplyFailure::before_write)?;
    tracing::debug!(paths = ?snapshot.paths(), "snapshot taken");

    let mut touched = Vec::with_capacity(prepared.writes.len());
    for write in &prepared.writes {
        if let Err(source) = write_one(write) {
            tracing::warn!(
                path = %write.relative,
                error = %source,
                "write failed, restoring snapshot"
            );
            let outcome = rollback(&snapshot);
            return Err(ApplyFailure {
                error: ApplyError::Io {
                    path: write.relative.clone(),
                    source,
                },
                rollback: outcome,
            });
        }
        touched.push(write.relative.clone());
    }

    tracing::debug!(files = touched.len(), "patch batch written");
    Ok(ApplyReport { touched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn replace(file: &str, search: &str, replace: &str) -> PatchAction {
        PatchAction::Replace {
            file: file.to_string(),
            search_block: search.to_string(),
            replace_block: replace.to_string(),
        }
    }

    fn create(file: &str, content: &str) -> PatchAction {
        PatchAction::Create {
            file: file.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_apply_replace_create_delete() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() { 1 }\n").unwrap();
        fs::write(dir.path().join("old.rs"), "old\n").unwrap();

        let report = apply(
            dir.path(),
            &[
                replace("a.rs", "{ 1 }", "{ 2 }"),
                create("src/nested/b.rs", "fn b() {}\n"),
                PatchAction::Delete {
                    file: "old.rs".to_string(),
                },
            ],
        )
        .unwrap();

        assert_eq!(report.touched, vec!["a.rs", "src/nested/b.rs", "old.rs"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "fn a() { 2 }\n"
        );
        assert!(dir.path().join("src/nested/b.rs").is_file());
        assert!(!dir.path().join("old.rs").exists());
    }

    #[test]
    fn test_search_miss_leaves_disk_untouched() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();

        let err = apply(
            dir.path(),
            &[
                create("b.rs", "fn b() {}\n"),
                replace("a.rs", "fn missing() {}", "x"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err.error, ApplyError::SearchBlockNotFound { .. }));
        assert!(!err.rollback.attempted);
        assert!(!dir.path().join("b.rs").exists());
    }

    #[test]
    fn test_ambiguous_search_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "x();\nx();\n").unwrap();
        let err = prepare(dir.path(), &[replace("a.rs", "x();", "y();")]).unwrap_err();
        assert!(matches!(err, ApplyError::AmbiguousSearch { count: 2, .. }));
        assert!(err.to_string().contains("matches 2 times"));
    }

    #[test]
    fn test_crlf_and_trimmed_anchors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one\r\ntwo\r\nthree\r\n").unwrap();
        fs::write(dir.path().join("b.txt"), "alpha beta\n").unwrap();
        apply(
            dir.path(),
            &[
                replace("a.txt", "one\ntwo", "uno\ndos"),
                replace("b.txt", "  beta \n", "gamma"),
            ],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "uno\r\ndos\r\nthree\r\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("b.txt")).unwrap(),
            "alpha gamma\n"
        );
    }

    #[test]
    fn test_sequential_edits_to_one_file_compose() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "let a = 1;\nlet b = 2;\n").unwrap();
        let prepared = prepare(
            dir.path(),
            &[
                replace("a.rs", "let a = 1;", "let a = 10;"),
                replace("a.rs", "let a = 10;\nlet b = 2;", "let a = 10;\nlet b = 20;"),
            ],
        )
        .unwrap();
        assert_eq!(prepared.paths(), vec!["a.rs"]);
    }

    #[test]
    fn test_missing_file_for_replace_and_delete() {
        let dir = tempdir().unwrap();
        let err = prepare(dir.path(), &[replace("nope.rs", "a", "b")]).unwrap_err();
        assert!(matches!(err, ApplyError::MissingFile { .. }));
        let err = prepare(
            dir.path(),
            &[PatchAction::Delete {
                file: "nope.rs".to_string(),
            }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot delete nope.rs"));
    }

    #[test]
    fn test_failed_write_restores_snapshot() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "original\n").unwrap();
        fs::write(dir.path().join("blocker"), "i am a file\n").unwrap();

        let err = apply(
            dir.path(),
            &[
                create("a.rs", "changed\n"),
                create("new/dir/c.rs", "c\n"),
                create("blocker/b.rs", "b\n"),
            ],
        )
        .unwrap_err();

        assert!(matches!(err.error, ApplyError::Io { .. }));
        assert!(err.rollback.attempted);
        assert!(err.rollback.ok);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "original\n"
        );
        assert!(!dir.path().join("new/dir/c.rs").exists());
        assert!(!dir.path().join("new").exists());
    }

    #[test]
    fn test_classify_follows_recovery_policy() {
        let miss = ApplyError::SearchBlockNotFound {
            path: "a.rs".to_string(),
        };
        let ambiguous = ApplyError::AmbiguousSearch {
            path: "a.rs".to_string(),
            count: 3,
        };
        let default = RecoveryPolicy::default();
        assert_eq!(classify_apply_error(&miss, &default), FailureClass::SearchBlockMiss);
        assert_eq!(
            classify_apply_error(&ambiguous, &default),
            FailureClass::SearchBlockMiss
        );

        let strict = RecoveryPolicy {
            search_miss: MatchFailureAction::Fatal,
            ambiguous_match: MatchFailureAction::Fatal,
        };
        assert_eq!(classify_apply_error(&miss, &strict), FailureClass::ApplyFatal);

        let io = ApplyError::Io {
            path: "a.rs".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(classify_apply_error(&io, &default), FailureClass::ApplyFatal);
    }

    #[test]
    fn test_unrestorable_snapshot_reports_failed_rollback() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("util"), "legacy\n").unwrap();
        fs::write(dir.path().join("blocker"), "i am a file\n").unwrap();

        // `util` becomes a directory mid-batch, so its original bytes cannot be put back.
        let err = apply(
            dir.path(),
            &[
                PatchAction::Delete {
                    file: "util".to_string(),
                },
                create("util/index.rs", "pub fn util() {}\n"),
                create("blocker/b.rs", "b\n"),
            ],
        )
        .unwrap_err();

        assert!(matches!(err.error, ApplyError::Io { ref path, .. } if path == "blocker/b.rs"));
        assert!(err.rollback.attempted);
        assert!(!err.rollback.ok);
        assert!(err.rollback.error.as_deref().unwrap().starts_with("util:"));
        assert!(!dir.path().join("util/index.rs").exists());
        assert!(dir.path().join("util").is_dir());
    }
}
