//! Path authorization for edit targets.
//!
//! The allow-list of an invocation is the plan's `target_files` ∪ `create_files`
//! minus anything read-only; when that is empty it falls back to the context
//! bundle's writer allow-list. Read-only paths win over every other rule.

use crate::plan::{ContextBundle, Plan};
use regex::Regex;
use std::sync::OnceLock;

/// Canonical repo-relative spelling of `raw`: forward slashes, no leading `./`,
/// no duplicate or trailing slashes. `None` for empty and `.`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut text = unified.as_str();
    while let Some(rest) = text.strip_prefix("./") {
        text = rest;
    }
    let segments: Vec<&str> = text
        .split('/')
        .enumerate()
        .filter(|(idx, seg)| !seg.is_empty() || *idx == 0)
        .map(|(_, seg)| seg)
        .filter(|seg| *seg != ".")
        .collect();
    let joined = segments.join("/");
    let joined = if joined.len() > 1 {
        joined.trim_end_matches('/').to_string()
    } else {
        joined
    };
    if joined.is_empty() || joined == "." {
        None
    } else {
        Some(joined)
    }
}

/// Whether `path` equals `prefix` or lives under it as a directory.
pub fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

fn is_absolute_like(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('~')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn placeholder_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\{[^}]*\}|<[^>]*>|\$\{|\$[a-z_]|(^|/)path/to(/|$)|(^|/)your[-_][a-z]|[*?]|\.\.\.|…",
        )
        .expect("static placeholder path regex")
    })
}

/// Unresolved template segments such as `src/{module}.rs`, `<file>`, `path/to/x`.
pub fn looks_like_placeholder_path(path: &str) -> bool {
    placeholder_path_re().is_match(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowListSource {
    Plan,
    ContextBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathUse {
    Modify,
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathViolation {
    Empty,
    Absolute(String),
    Traversal(String),
    Placeholder(String),
    ReadOnly { path: String, rule: String },
    NotAllowed(String),
    CreateNotPermitted(String),
}

impl PathViolation {
    pub fn path(&self) -> &str {
        match self {
            PathViolation::Empty => "",
            PathViolation::Absolute(path)
            | PathViolation::Traversal(path)
            | PathViolation::Placeholder(path)
            | PathViolation::NotAllowed(path)
            | PathViolation::CreateNotPermitted(path)
            | PathViolation::ReadOnly { path, .. } => path,
        }
    }
}

impl std::fmt::Display for PathViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathViolation::Empty => write!(f, "empty file path"),
            PathViolation::Absolute(path) => write!(f, "absolute path not allowed: {}", path),
            PathViolation::Traversal(path) => write!(f, "parent traversal not allowed: {}", path),
            PathViolation::Placeholder(path) => {
                write!(f, "path looks like an unresolved placeholder: {}", path)
            }
            PathViolation::ReadOnly { path, rule } => {
                write!(f, "disallowed file {} (read-only: {})", path, rule)
            }
            PathViolation::NotAllowed(path) => {
                write!(f, "disallowed file {} (not in the allowed set)", path)
            }
            PathViolation::CreateNotPermitted(path) => write!(
                f,
                "disallowed file {} (does not exist and is not listed for creation)",
                path
            ),
        }
    }
}

impl std::error::Error for PathViolation {}

/// The resolved write policy of one builder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    allowed: Vec<String>,
    creatable: Vec<String>,
    read_only: Vec<String>,
    source: AllowListSource,
}

fn normalized_unique<'a>(paths: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths.filter_map(|p| normalize_path(p)) {
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

impl PathPolicy {
    pub fn new(plan: &Plan, bundle: &ContextBundle) -> Self {
        let read_only = normalized_unique(bundle.read_only_paths.iter());
        let is_read_only = |path: &String| read_only.iter().any(|ro| is_under(path, ro));

        let from_plan: Vec<String> =
            normalized_unique(plan.target_files.iter().chain(plan.create_files.iter()))
                .into_iter()
                .filter(|p| !is_read_only(p))
                .collect();

        if from_plan.is_empty() {
            let allowed: Vec<String> = normalized_unique(bundle.allow_write_paths.iter())
                .into_iter()
                .filter(|p| !is_read_only(p))
                .collect();
            return Self {
                creatable: allowed.clone(),
                allowed,
                read_only,
                source: AllowListSource::ContextBundle,
            };
        }

        let creatable = normalized_unique(plan.create_files.iter())
            .into_iter()
            .filter(|p| !is_read_only(p))
            .collect();
        Self {
            allowed: from_plan,
            creatable,
            read_only,
            source: AllowListSource::Plan,
        }
    }

    pub fn allowed_paths(&self) -> &[String] {
        &self.allowed
    }

    pub fn creatable_paths(&self) -> &[String] {
        &self.creatable
    }

    pub fn read_only_paths(&self) -> &[String] {
        &self.read_only
    }

    pub fn source(&self) -> AllowListSource {
        self.source
    }

    pub fn read_only_rule_for(&self, path: &str) -> Option<&str> {
        self.read_only
            .iter()
            .find(|ro| is_under(path, ro))
            .map(String::as_str)
    }

    /// Check one edit target. `exists` reports whether the path is already present
    /// in the workspace or the context bundle. Returns the normalized path.
    pub fn check(&self, raw: &str, usage: PathUse, exists: bool) -> Result<String, PathViolation> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathViolation::Empty);
        }
        let unified = trimmed.replace('\\', "/");
        if is_absolute_like(&unified) {
            return Err(PathViolation::Absolute(trimmed.to_string()));
        }
        let path = normalize_path(&unified).ok_or(PathViolation::Empty)?;
        if path.split('/').any(|seg| seg == "..") {
            return Err(PathViolation::Traversal(path));
        }
        if looks_like_placeholder_path(&path) {
            return Err(PathViolation::Placeholder(path));
        }
        if let Some(rule) = self.read_only_rule_for(&path) {
            return Err(PathViolation::ReadOnly {
                rule: rule.to_string(),
                path,
            });
        }
        if !self.allowed.iter().any(|allowed| is_under(&path, allowed)) {
            return Err(PathViolation::NotAllowed(path));
        }
        if usage == PathUse::Create
            && !exists
            && !self.creatable.iter().any(|allowed| is_under(&path, allowed))
        {
            return Err(PathViolation::CreateNotPermitted(path));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(targets: &[&str], creates: &[&str]) -> Plan {
        Plan {
            target_files: targets.iter().map(|s| s.to_string()).collect(),
            create_files: creates.iter().map(|s| s.to_string()).collect(),
            ..Plan::default()
        }
    }

    fn bundle(allow: &[&str], read_only: &[&str]) -> ContextBundle {
        ContextBundle {
            allow_write_paths: allow.iter().map(|s| s.to_string()).collect(),
            read_only_paths: read_only.iter().map(|s| s.to_string()).collect(),
            ..ContextBundle::default()
        }
    }

    #[test]
    fn normalize_path_strips_noise() {
        assert_eq!(normalize_path("./src//a.rs"), Some("src/a.rs".to_string()));
        assert_eq!(normalize_path("src\\a.rs"), Some("src/a.rs".to_string()));
        assert_eq!(normalize_path("docs/"), Some("docs".to_string()));
        assert_eq!(normalize_path("."), None);
        assert_eq!(normalize_path("  "), None);
    }

    #[test]
    fn is_under_respects_segment_boundaries() {
        assert!(is_under("docs/readme.md", "docs"));
        assert!(is_under("docs", "docs"));
        assert!(!is_under("docsite/index.md", "docs"));
    }

    #[test]
    fn read_only_directory_blocks_nested_file() {
        let policy = PathPolicy::new(&plan(&["docs/readme.md"], &[]), &bundle(&[], &["docs"]));
        let err = policy
            .check("docs/readme.md", PathUse::Modify, true)
            .unwrap_err();
        assert!(matches!(err, PathViolation::ReadOnly { ref rule, .. } if rule == "docs"));
        assert!(err.to_string().contains("disallowed file"));
    }

    #[test]
    fn read_only_entries_are_removed_from_plan_allow_list() {
        let policy = PathPolicy::new(
            &plan(&["docs/readme.md", "src/a.ts"], &[]),
            &bundle(&[], &["docs"]),
        );
        assert_eq!(policy.allowed_paths(), &["src/a.ts".to_string()]);
        assert_eq!(policy.source(), AllowListSource::Plan);
    }

    #[test]
    fn empty_plan_falls_back_to_bundle_allow_list() {
        let policy = PathPolicy::new(&plan(&[], &[]), &bundle(&["src"], &["src/generated"]));
        assert_eq!(policy.source(), AllowListSource::ContextBundle);
        assert!(policy.check("src/lib.rs", PathUse::Modify, true).is_ok());
        assert!(policy
            .check("src/generated/out.rs", PathUse::Modify, true)
            .is_err());
    }

    #[test]
    fn escapes_and_placeholders_are_rejected() {
        let policy = PathPolicy::new(&plan(&["src"], &[]), &bundle(&[], &[]));
        assert!(matches!(
            policy.check("/etc/passwd", PathUse::Modify, true),
            Err(PathViolation::Absolute(_))
        ));
        assert!(matches!(
            policy.check("src/../../x", PathUse::Modify, true),
            Err(PathViolation::Traversal(_))
        ));
        assert!(matches!(
            policy.check("src/{module}.rs", PathUse::Modify, true),
            Err(PathViolation::Placeholder(_))
        ));
        assert!(matches!(
            policy.check("path/to/file.rs", PathUse::Modify, true),
            Err(PathViolation::Placeholder(_))
        ));
    }

    #[test]
    fn create_requires_listing_when_file_is_new() {
        let policy = PathPolicy::new(&plan(&["src/a.rs"], &["src/new.rs"]), &bundle(&[], &[]));
        assert!(policy.check("src/new.rs", PathUse::Create, false).is_ok());
        assert!(policy.check("src/a.rs", PathUse::Create, true).is_ok());
        assert!(matches!(
            policy.check("src/a.rs", PathUse::Create, false),
            Err(PathViolation::CreateNotPermitted(_))
        ));
        assert!(matches!(
            policy.check("src/other.rs", PathUse::Modify, true),
            Err(PathViolation::NotAllowed(_))
        ));
    }
}
