//! Proposed-edit data types and the placeholder heuristics shared by every gate.

use serde::{Deserialize, Serialize};

/// The two wire shapes a builder response may take. Exactly one per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    /// `{"patches":[{"action":...,"file":...}]}`
    SearchReplace,
    /// `{"files":[{"path":...,"content":...}]}`
    FileWrites,
}

impl PatchFormat {
    /// The only top-level key accepted for this format.
    pub fn array_key(&self) -> &'static str {
        match self {
            PatchFormat::SearchReplace => "patches",
            PatchFormat::FileWrites => "files",
        }
    }

    pub fn other(&self) -> PatchFormat {
        match self {
            PatchFormat::SearchReplace => PatchFormat::FileWrites,
            PatchFormat::FileWrites => PatchFormat::SearchReplace,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PatchFormat::SearchReplace => "search_replace",
            PatchFormat::FileWrites => "file_writes",
        }
    }
}

impl std::fmt::Display for PatchFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One proposed edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PatchAction {
    /// Write the full content of `file`, creating it if needed.
    Create { file: String, content: String },
    /// Replace the unique occurrence of `search_block` with `replace_block`.
    Replace {
        file: String,
        search_block: String,
        replace_block: String,
    },
    Delete { file: String },
}

impl PatchAction {
    pub fn file(&self) -> &str {
        match self {
            PatchAction::Create { file, .. }
            | PatchAction::Replace { file, .. }
            | PatchAction::Delete { file } => file,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PatchAction::Create { .. } => "create",
            PatchAction::Replace { .. } => "replace",
            PatchAction::Delete { .. } => "delete",
        }
    }
}

/// Full-file write entry of the `file_writes` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

/// A validated proposal in exactly one wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchPayload {
    Patches(Vec<PatchAction>),
    Files(Vec<FileWrite>),
}

impl PatchPayload {
    pub fn format(&self) -> PatchFormat {
        match self {
            PatchPayload::Patches(_) => PatchFormat::SearchReplace,
            PatchPayload::Files(_) => PatchFormat::FileWrites,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PatchPayload::Patches(actions) => actions.len(),
            PatchPayload::Files(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lower the payload to actions. A full-file write becomes a `create`.
    pub fn into_actions(self) -> Vec<PatchAction> {
        match self {
            PatchPayload::Patches(actions) => actions,
            PatchPayload::Files(files) => files
                .into_iter()
                .map(|f| PatchAction::Create {
                    file: f.path,
                    content: f.content,
                })
                .collect(),
        }
    }

    pub fn target_paths(&self) -> Vec<&str> {
        match self {
            PatchPayload::Patches(actions) => actions.iter().map(PatchAction::file).collect(),
            PatchPayload::Files(files) => files.iter().map(|f| f.path.as_str()).collect(),
        }
    }
}

const PLACEHOLDER_SENTINELS: &[&str] = &[
    "todo",
    "tbd",
    "fixme",
    "placeholder",
    "<placeholder>",
    "[placeholder]",
    "<content>",
    "<full text>",
    "<full content>",
    "<search>",
    "<replace>",
    "your code here",
    "code here",
    "implementation here",
    "rest of file",
    "rest of the file",
    "existing code",
    "unchanged",
];

const ELISION_HINTS: &[&str] = &[
    "existing", "rest", "unchanged", "remaining", "same", "omitted", "code", "etc",
];

fn strip_comment_markers(line: &str) -> &str {
    let mut text = line.trim();
    for prefix in ["<!--", "/*", "//", "#", "--", "*"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start();
            break;
        }
    }
    for suffix in ["-->", "*/"] {
        if let Some(rest) = text.strip_suffix(suffix) {
            text = rest.trim_end();
            break;
        }
    }
    text
}

fn is_elision_marker(text: &str) -> bool {
    let dots = text.chars().filter(|c| *c == '.').count();
    text.chars().all(|c| c == '.' || c == '…' || c.is_whitespace())
        && (dots >= 3 || text.contains('…'))
}

fn is_placeholder_line(line: &str) -> Option<bool> {
    let text = strip_comment_markers(line)
        .trim()
        .trim_end_matches(':')
        .to_ascii_lowercase();
    if text.is_empty() {
        return None;
    }
    if is_elision_marker(&text) {
        return Some(true);
    }
    if PLACEHOLDER_SENTINELS.contains(&text.as_str()) {
        return Some(true);
    }
    if text.starts_with("todo:") || text.starts_with("todo ") {
        return Some(true);
    }
    if text.contains("rest of the file")
        || text.contains("rest of file")
        || text.ends_with("unchanged")
        || (text.contains("existing code") && text.len() < 40)
    {
        return Some(true);
    }
    let elided = text.starts_with("...") || text.starts_with('…');
    if elided && ELISION_HINTS.iter().any(|hint| text.contains(hint)) {
        return Some(true);
    }
    Some(false)
}

/// Whether `text` is empty or consists only of ellipsis/TODO sentinels.
///
/// Comment-only sentinel lines (`// ...`, `# rest of file unchanged`) count as
/// placeholders; any line of real content makes the whole text non-placeholder.
pub fn is_placeholder_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let mut saw_sentinel = false;
    for line in trimmed.lines() {
        match is_placeholder_line(line) {
            Some(true) => saw_sentinel = true,
            Some(false) => return false,
            None => {}
        }
    }
    saw_sentinel
}

/// Whether a search anchor elides code with `...`/`…`, which can never match the
/// live file. Spread/rest syntax such as `...args` is allowed.
pub fn contains_elided_region(search: &str) -> bool {
    let text = search.trim();
    if text.is_empty() {
        return false;
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut idx = 0usize;
    while idx < len {
        let (is_marker, start, end) =
            if idx + 2 < len && chars[idx] == '.' && chars[idx + 1] == '.' && chars[idx + 2] == '.'
            {
                (true, idx, idx + 3)
            } else if chars[idx] == '…' {
                (true, idx, idx + 1)
            } else {
                (false, 0, 0)
            };
        if !is_marker {
            idx += 1;
            continue;
        }

        let prev = if start == 0 {
            None
        } else {
            Some(chars[start - 1])
        };
        let next = chars.get(end).copied();
        let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$';
        let prev_is_ident = prev.map(is_ident).unwrap_or(false);
        let next_is_ident = next.map(is_ident).unwrap_or(false);

        if !(prev_is_ident || next_is_ident) {
            return true;
        }
        idx = end;
    }

    false
}
