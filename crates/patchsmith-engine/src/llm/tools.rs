//! Tools offered to the builder during a tool-enabled turn.
//!
//! Exploration tools read the workspace. Edit tools only stage actions on the
//! session; nothing is written until the staged payload passes the quality
//! gate and path authorization.

use patchsmith_adapters::util::{resolve_existing_workspace_path, resolve_workspace_path, truncate};
use patchsmith_core::patch::PatchAction;
use patchsmith_core::ContextRequest;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// ═══════════════════════════════════════════════════════════════════════════
//  TOOL DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Tool definitions for the LLM
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// A tool call from the model
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Result of executing a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
}

pub const READ_FILE: &str = "read_file";
pub const LIST_FILES: &str = "list_files";
pub const SEARCH: &str = "search";
pub const CREATE_FILE: &str = "create_file";
pub const REPLACE_IN_FILE: &str = "replace_in_file";
pub const DELETE_FILE: &str = "delete_file";
pub const REQUEST_CONTEXT: &str = "request_context";

const MAX_OUTPUT_SIZE: usize = 6000;
const MAX_PATTERN_LENGTH: usize = 500;
const MAX_SEARCH_MATCHES: usize = 80;
const DEFAULT_LIST_DEPTH: usize = 3;
const MAX_LIST_ENTRIES: usize = 400;
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "dist", "build"];

fn tool(
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function",
        function: FunctionDefinition {
            name,
            description,
            parameters,
        },
    }
}

pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            READ_FILE,
            "Read a workspace file with line numbers. Optionally restrict to a 1-based line range.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Workspace-relative file path" },
                    "start_line": { "type": "integer", "description": "First line (default: 1)" },
                    "end_line": { "type": "integer", "description": "Last line (default: end of file)" }
                },
                "required": ["path"]
            }),
        ),
        tool(
            LIST_FILES,
            "List files under a workspace directory.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory (default: workspace root)" },
                    "max_depth": { "type": "integer", "description": "Max depth (default: 3)" }
                }
            }),
        ),
        tool(
            SEARCH,
            "Regex search across workspace files. Returns path:line: text matches.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regular expression" },
                    "path": { "type": "string", "description": "File or directory to search (default: workspace root)" }
                },
                "required": ["pattern"]
            }),
        ),
        tool(
            CREATE_FILE,
            "Stage a full-content write of a file listed for creation or modification. Content must be complete; no placeholders.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string", "description": "Complete file content" }
                },
                "required": ["path", "content"]
            }),
        ),
        tool(
            REPLACE_IN_FILE,
            "Stage a search/replace edit. `search` must be copied verbatim from the file and match exactly once.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "search": { "type": "string", "description": "Exact text to find" },
                    "replace": { "type": "string", "description": "Replacement text" }
                },
                "required": ["path", "search", "replace"]
            }),
        ),
        tool(
            DELETE_FILE,
            "Stage deletion of a file. Only valid when the plan explicitly calls for deleting it.",
            serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        ),
        tool(
            REQUEST_CONTEXT,
            "Stop and ask for more context instead of editing. Use when the provided material is insufficient.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" },
                    "queries": { "type": "array", "items": { "type": "string" } },
                    "files": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["reason"]
            }),
        ),
    ]
}

pub fn is_edit_tool(name: &str) -> bool {
    matches!(name, CREATE_FILE | REPLACE_IN_FILE | DELETE_FILE)
}

// ═══════════════════════════════════════════════════════════════════════════
//  TOOL EXECUTION
// ═══════════════════════════════════════════════════════════════════════════

/// Per-turn state mutated by tool calls.
#[derive(Debug)]
pub struct ToolSession {
    root: PathBuf,
    staged: Vec<PatchAction>,
    context_request: Option<ContextRequest>,
    executed: usize,
}

impl ToolSession {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            staged: Vec::new(),
            context_request: None,
            executed: 0,
        }
    }

    pub fn staged(&self) -> &[PatchAction] {
        &self.staged
    }

    pub fn context_request(&self) -> Option<&ContextRequest> {
        self.context_request.as_ref()
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn into_parts(self) -> (Vec<PatchAction>, Option<ContextRequest>) {
        (self.staged, self.context_request)
    }

    pub fn execute(&mut self, call: &ToolCall) -> ToolResult {
        self.executed += 1;
        let args = call.function.arguments.as_str();
        let content = match call.function.name.as_str() {
            READ_FILE => execute_read_file(&self.root, args),
            LIST_FILES => execute_list_files(&self.root, args),
            SEARCH => execute_search(&self.root, args),
            CREATE_FILE => self.stage_create(args),
            REPLACE_IN_FILE => self.stage_replace(args),
            DELETE_FILE => self.stage_delete(args),
            REQUEST_CONTEXT => self.record_context_request(args),
            other => format!(
                "Unknown tool: {}. Available: read_file, list_files, search, create_file, replace_in_file, delete_file, request_context",
                other
            ),
        };
        ToolResult {
            tool_call_id: call.id.clone(),
            content: truncate_output(content),
        }
    }

    fn stage_create(&mut self, args_json: &str) -> String {
        #[derive(Deserialize)]
        struct Args {
            path: String,
            content: String,
        }
        let args: Args = match serde_json::from_str(args_json) {
            Ok(a) => a,
            Err(e) => return format!("Invalid arguments: {}", e),
        };
        if args.path.trim().is_empty() {
            return "Invalid arguments: path is empty".to_string();
        }
        let message = format!(
            "Staged full write of {} ({} bytes). Not applied yet.",
            args.path,
            args.content.len()
        );
        self.staged.push(PatchAction::Create {
            file: args.path,
            content: args.content,
        });
        message
    }

    fn stage_replace(&mut self, args_json: &str) -> String {
        #[derive(Deserialize)]
        struct Args {
            path: String,
            search: String,
            replace: String,
        }
        let args: Args = match serde_json::from_str(args_json) {
            Ok(a) => a,
            Err(e) => return format!("Invalid arguments: {}", e),
        };
        if args.path.trim().is_empty() {
            return "Invalid arguments: path is empty".to_string();
        }
        let message = format!("Staged replace in {}. Not applied yet.", args.path);
        self.staged.push(PatchAction::Replace {
            file: args.path,
            search_block: args.search,
            replace_block: args.replace,
        });
        message
    }

    fn stage_delete(&mut self, args_json: &str) -> String {
        #[derive(Deserialize)]
        struct Args {
            path: String,
        }
        let args: Args = match serde_json::from_str(args_json) {
            Ok(a) => a,
            Err(e) => return format!("Invalid arguments: {}", e),
        };
        if args.path.trim().is_empty() {
            return "Invalid arguments: path is empty".to_string();
        }
        let message = format!("Staged deletion of {}. Not applied yet.", args.path);
        self.staged.push(PatchAction::Delete { file: args.path });
        message
    }

    fn record_context_request(&mut self, args_json: &str) -> String {
        match serde_json::from_str::<ContextRequest>(args_json) {
            Ok(request) => {
                self.context_request = Some(request);
                "Context request recorded. Stop here.".to_string()
            }
            Err(e) => format!("Invalid arguments: {}", e),
        }
    }
}

fn execute_read_file(root: &Path, args_json: &str) -> String {
    #[derive(Deserialize)]
    struct Args {
        path: String,
        start_line: Option<usize>,
        end_line: Option<usize>,
    }

    let args: Args = match serde_json::from_str(args_json) {
        Ok(a) => a,
        Err(e) => return format!("Invalid arguments: {}", e),
    };

    let target = match resolve_existing_workspace_path(root, Path::new(&args.path)) {
        Ok(resolved) => resolved.absolute,
        Err(e) => return format!("Invalid path '{}': {}", args.path, e),
    };
    if target.is_dir() {
        return format!("{} is a directory. Use list_files.", args.path);
    }

    let content = match fs::read_to_string(&target) {
        Ok(content) => content,
        Err(e) => return format!("Failed to read file: {}", e),
    };
    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    if total_lines == 0 {
        return format!("{} is empty.", args.path);
    }

    let start = args.start_line.unwrap_or(1).max(1);
    let end = args.end_line.unwrap_or(total_lines).min(total_lines);
    if start > total_lines {
        return format!("Start line {} exceeds file length ({})", start, total_lines);
    }
    if end < start {
        return "Invalid range: end_line must be >= start_line".to_string();
    }

    let mut output = String::new();
    if start > 1 {
        output.push_str(&format!("... (lines 1-{} above)\n\n", start - 1));
    }
    for (i, line) in lines[start - 1..end].iter().enumerate() {
        output.push_str(&format!("{:>4}│ {}\n", start + i, line));
    }
    if end < total_lines {
        output.push_str(&format!("\n... ({} more lines below)\n", total_lines - end));
    }
    output
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIPPED_DIRS.contains(&name))
            .unwrap_or(false)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn execute_list_files(root: &Path, args_json: &str) -> String {
    #[derive(Deserialize, Default)]
    struct Args {
        path: Option<String>,
        max_depth: Option<usize>,
    }

    let args: Args = if args_json.trim().is_empty() {
        Args::default()
    } else {
        match serde_json::from_str(args_json) {
            Ok(a) => a,
            Err(e) => return format!("Invalid arguments: {}", e),
        }
    };

    let canonical_root = match root.canonicalize() {
        Ok(path) => path,
        Err(e) => return format!("Failed to resolve workspace root: {}", e),
    };
    let target = match args.path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(p) => match resolve_existing_workspace_path(root, Path::new(p)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return format!("Invalid path '{}': {}", p, e),
        },
        None => canonical_root.clone(),
    };

    let mut entries = Vec::new();
    let walker = WalkDir::new(&target)
        .max_depth(args.max_depth.unwrap_or(DEFAULT_LIST_DEPTH).max(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));
    for entry in walker.flatten() {
        if entry.depth() == 0 {
            continue;
        }
        let mut line = relative_display(&canonical_root, entry.path());
        if entry.file_type().is_dir() {
            line.push('/');
        }
        entries.push(line);
        if entries.len() >= MAX_LIST_ENTRIES {
            entries.push(format!("... (stopped after {} entries)", MAX_LIST_ENTRIES));
            break;
        }
    }

    if entries.is_empty() {
        "No files found.".to_string()
    } else {
        entries.join("\n")
    }
}

fn execute_search(root: &Path, args_json: &str) -> String {
    #[derive(Deserialize)]
    struct Args {
        pattern: String,
        path: Option<String>,
    }

    let args: Args = match serde_json::from_str(args_json) {
        Ok(a) => a,
        Err(e) => return format!("Invalid arguments: {}", e),
    };
    if args.pattern.is_empty() {
        return "Pattern is empty".to_string();
    }
    if args.pattern.len() > MAX_PATTERN_LENGTH {
        return format!("Pattern too long (max {} characters)", MAX_PATTERN_LENGTH);
    }
    let regex = match RegexBuilder::new(&args.pattern)
        .size_limit(1 << 20)
        .build()
    {
        Ok(re) => re,
        Err(e) => return format!("Invalid pattern: {}", e),
    };

    let canonical_root = match root.canonicalize() {
        Ok(path) => path,
        Err(e) => return format!("Failed to resolve workspace root: {}", e),
    };
    let target = match args.path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(p) => match resolve_workspace_path(root, Path::new(p)) {
            Ok(resolved) => resolved.absolute,
            Err(e) => return format!("Invalid path '{}': {}", p, e),
        },
        None => canonical_root.clone(),
    };

    let mut matches = Vec::new();
    let walker = WalkDir::new(&target)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));
    'files: for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = relative_display(&canonical_root, entry.path());
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}: {}", rel, idx + 1, truncate(line.trim(), 200)));
                if matches.len() >= MAX_SEARCH_MATCHES {
                    matches.push(format!("... (stopped after {} matches)", MAX_SEARCH_MATCHES));
                    break 'files;
                }
            }
        }
    }

    if matches.is_empty() {
        format!("No matches found for pattern: {}", args.pattern)
    } else {
        matches.join("\n")
    }
}

/// Truncate output at line boundary
fn truncate_output(result: String) -> String {
    if result.len() > MAX_OUTPUT_SIZE {
        let mut cut = MAX_OUTPUT_SIZE;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncate_at = result[..cut].rfind('\n').unwrap_or(cut);
        format!(
            "{}\n\n... (truncated - use read_file with a line range for specific sections)",
            &result[..truncate_at]
        )
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: format!("call_{}", name),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn alpha() {}\npub fn beta() {}\n").unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/junk.rs"), "pub fn alpha() {}\n").unwrap();
        dir
    }

    #[test]
    fn test_read_file_numbers_lines_and_honors_range() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        let result = session.execute(&call(
            READ_FILE,
            serde_json::json!({"path": "src/lib.rs", "start_line": 2}),
        ));
        assert!(result.content.contains("   2│ pub fn beta() {}"));
        assert!(result.content.contains("lines 1-1 above"));
        assert!(!result.content.contains("alpha"));
    }

    #[test]
    fn test_read_file_rejects_escape() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        let result = session.execute(&call(READ_FILE, serde_json::json!({"path": "../x"})));
        assert!(result.content.starts_with("Invalid path"));
    }

    #[test]
    fn test_search_skips_build_dirs() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        let result = session.execute(&call(SEARCH, serde_json::json!({"pattern": "fn alpha"})));
        assert!(result.content.contains("src/lib.rs:1:"));
        assert!(!result.content.contains("target/"));
    }

    #[test]
    fn test_list_files_walks_workspace() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        let result = session.execute(&call(LIST_FILES, serde_json::json!({})));
        assert!(result.content.contains("src/"));
        assert!(result.content.contains("src/lib.rs"));
        assert!(!result.content.contains("junk.rs"));
    }

    #[test]
    fn test_edit_tools_only_stage() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        session.execute(&call(
            REPLACE_IN_FILE,
            serde_json::json!({"path": "src/lib.rs", "search": "alpha", "replace": "gamma"}),
        ));
        session.execute(&call(
            CREATE_FILE,
            serde_json::json!({"path": "src/new.rs", "content": "pub fn n() {}\n"}),
        ));
        assert_eq!(session.staged().len(), 2);
        assert_eq!(session.staged()[0].kind(), "replace");
        assert!(!dir.path().join("src/new.rs").exists());
        let on_disk = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(on_disk.contains("alpha"));
    }

    #[test]
    fn test_request_context_is_recorded() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        session.execute(&call(
            REQUEST_CONTEXT,
            serde_json::json!({"reason": "need auth", "queries": ["auth flow"]}),
        ));
        let request = session.context_request().unwrap();
        assert_eq!(request.queries, vec!["auth flow".to_string()]);
        assert_eq!(session.executed(), 1);
    }

    #[test]
    fn test_unknown_tool_lists_available_tools() {
        let dir = workspace();
        let mut session = ToolSession::new(dir.path());
        let result = session.execute(&call("bash", serde_json::json!({})));
        assert!(result.content.contains("Unknown tool: bash"));
        assert!(session.staged().is_empty());
    }

    #[test]
    fn test_edit_tool_names() {
        assert!(is_edit_tool(CREATE_FILE));
        assert!(!is_edit_tool(READ_FILE));
        assert!(!is_edit_tool(REQUEST_CONTEXT));
        let names: Vec<_> = get_tool_definitions()
            .iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names.len(), 7);
        assert!(names.contains(&REQUEST_CONTEXT));
    }
}
