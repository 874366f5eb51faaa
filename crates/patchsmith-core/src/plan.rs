//! Inputs handed to the builder by the planning role.
//!
//! Both types are immutable for the duration of one builder invocation.

use crate::authz::normalize_path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// What to change and where, as produced by the upstream planning role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Ordered step descriptions.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Paths the edit may modify.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Paths explicitly permitted to be newly created.
    #[serde(default)]
    pub create_files: Vec<String>,
    #[serde(default)]
    pub risk_assessment: String,
    #[serde(default)]
    pub verification: Vec<String>,
}

fn explicit_deletion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(delete|deletes|deleted|deleting|deletion|rm)\b")
            .expect("static deletion regex")
    })
}

fn file_removal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(remove|removes|removing|drop|drops|dropping|get rid of)\b[^.\n]{0,48}\b(file|files|module|modules|directory|script|scripts)\b",
        )
        .expect("static removal regex")
    })
}

impl Plan {
    /// All free-form prose of the plan joined into one block.
    pub fn prose(&self) -> String {
        let mut parts: Vec<&str> = self.steps.iter().map(String::as_str).collect();
        if !self.risk_assessment.trim().is_empty() {
            parts.push(self.risk_assessment.as_str());
        }
        parts.extend(self.verification.iter().map(String::as_str));
        parts.join("\n")
    }

    /// Whether the plan's prose expresses an intent to delete files.
    ///
    /// `delete` actions are only valid when this holds.
    pub fn signals_deletion(&self) -> bool {
        let prose = self.prose();
        explicit_deletion_re().is_match(&prose) || file_removal_re().is_match(&prose)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceRole {
    #[default]
    Focus,
    Periphery,
}

/// A read-only excerpt of a workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSlice {
    pub path: String,
    #[serde(default)]
    pub role: SliceRole,
    /// 1-based line the excerpt starts at, when it is not the whole file.
    #[serde(default)]
    pub start_line: Option<usize>,
    pub content: String,
}

/// The read-only material the builder may consult.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    #[serde(default)]
    pub slices: Vec<FileSlice>,
    /// Writer allow-list, used when the plan names no files.
    #[serde(default)]
    pub allow_write_paths: Vec<String>,
    /// Paths (or directories) that must never be edit targets.
    #[serde(default)]
    pub read_only_paths: Vec<String>,
    /// Textual rendering used verbatim in the prompt.
    #[serde(default)]
    pub rendered: String,
}

impl ContextBundle {
    pub fn contains_path(&self, path: &str) -> bool {
        let Some(path) = normalize_path(path) else {
            return false;
        };
        self.slices
            .iter()
            .filter_map(|s| normalize_path(&s.path))
            .any(|p| p == path)
    }

    /// The prompt rendering. Falls back to a plain listing of the slices when the
    /// planner did not supply one.
    pub fn render(&self) -> String {
        if !self.rendered.trim().is_empty() {
            return self.rendered.clone();
        }
        let mut out = String::new();
        for slice in &self.slices {
            let role = match slice.role {
                SliceRole::Focus => "focus",
                SliceRole::Periphery => "periphery",
            };
            let start = slice
                .start_line
                .map(|line| format!(" (from line {})", line))
                .unwrap_or_default();
            out.push_str(&format!(
                "--- {} [{}]{}\n```\n{}\n```\n\n",
                slice.path, role, start, slice.content
            ));
        }
        out
    }
}
