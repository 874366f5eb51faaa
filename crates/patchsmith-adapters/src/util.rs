use std::path::{Component, Path, PathBuf};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// A path inside the workspace, in both spellings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

impl WorkspacePath {
    /// Forward-slash relative spelling used in reports and events.
    pub fn display_relative(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Resolve `candidate` under `root`, allowing the file itself not to exist yet.
///
/// Rejects empty, absolute and `..` paths, and any path whose nearest existing
/// ancestor resolves (through symlinks) outside the workspace.
pub fn resolve_workspace_path(root: &Path, candidate: &Path) -> Result<WorkspacePath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() || candidate.has_root() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve workspace root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes workspace: {}", candidate.display()));
    }
    if joined.is_symlink() {
        let target = joined
            .canonicalize()
            .map_err(|e| format!("Failed to resolve path {}: {}", candidate.display(), e))?;
        if !target.starts_with(&root) {
            return Err(format!("Path escapes workspace: {}", candidate.display()));
        }
    }

    let relative = joined
        .strip_prefix(&root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| candidate.to_path_buf());

    Ok(WorkspacePath {
        absolute: joined,
        relative,
    })
}

/// Like [`resolve_workspace_path`] but the file must already exist.
pub fn resolve_existing_workspace_path(
    root: &Path,
    candidate: &Path,
) -> Result<WorkspacePath, String> {
    let resolved = resolve_workspace_path(root, candidate)?;
    if !resolved.absolute.exists() {
        return Err(format!("File not found: {}", candidate.display()));
    }
    Ok(resolved)
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}
