use patchsmith_core::patch::PatchFormat;
use patchsmith_core::ResponseMode;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Core edit rules - shared across builder prompts
const EDIT_RULES: &str = r#"EDIT RULES:
- Only touch files listed as editable. Never edit read-only paths.
- Search text must be copied verbatim from the current file and match exactly once.
- Preserve indentation and surrounding style.
- No placeholders, ellipses, "rest of file unchanged" markers, or line numbers.
- Full-file content must be complete; it replaces the whole file.
- Delete files only when the plan explicitly says to delete them.
- Keep edits minimal and scoped to the plan."#;

const CONTEXT_REQUEST_RULE: &str = r#"If the provided context is not enough to make a correct edit, do not guess. Reply with exactly:
{"needs_context": true, "reason": "<why>", "queries": ["<what to look up>"], "files": ["<paths you need>"]}"#;

const SEARCH_REPLACE_SHAPE: &str = r#"OUTPUT (JSON object only, no prose, no markdown):
{"patches": [
  {"action": "replace", "file": "<path>", "search_block": "<exact existing text>", "replace_block": "<new text>"},
  {"action": "create", "file": "<path>", "content": "<complete file text>"},
  {"action": "delete", "file": "<path>"}
]}
The only top-level key is "patches"."#;

const FILE_WRITES_SHAPE: &str = r#"OUTPUT (JSON object only, no prose, no markdown):
{"files": [
  {"path": "<path>", "content": "<complete new file text>"}
]}
The only top-level key is "files". Every entry carries the entire file, not a fragment."#;

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPTS
// ═══════════════════════════════════════════════════════════════════════════════

pub const BUILDER_TOOLS_SYSTEM: &str = r#"You are the builder. You turn an approved plan into concrete file edits.

Explore with read_file, list_files and search. Stage every edit with create_file, replace_in_file or delete_file. Staged edits are validated and applied together after you finish; nothing is written before that.

When done, reply with a one-paragraph summary of what you changed.
If the context is insufficient, call request_context instead of editing."#;

pub const BUILDER_PATCH_SYSTEM: &str =
    "You are the builder. You turn an approved plan into concrete file edits, returned as a single JSON patch payload.";

pub const BUILDER_FREEFORM_SYSTEM: &str = "You are the builder. You turn an approved plan into concrete file edits. Describe each edit precisely: the file, the exact text to replace and its replacement, or the complete new file content.";

pub const SCHEMA_ONLY_SYSTEM: &str = r#"Your previous answer could not be used. Regenerate it.

Return ONLY the JSON payload in the exact shape below. No explanations, no markdown fences, no extra keys."#;

pub const INTERPRETER_SYSTEM: &str = r#"You convert another model's draft of code edits into a strict JSON patch payload.

Rules:
- Preserve the draft's intent exactly; do not invent new changes.
- Use only file paths the draft mentions that are in the allowed list.
- Copy search text verbatim from the draft.
- If the draft contains no usable edit, return an empty array."#;

pub fn wire_shape(format: PatchFormat) -> &'static str {
    match format {
        PatchFormat::SearchReplace => SEARCH_REPLACE_SHAPE,
        PatchFormat::FileWrites => FILE_WRITES_SHAPE,
    }
}

/// System prompt for the first request of an invocation.
pub fn builder_system(mode: ResponseMode, format: PatchFormat) -> String {
    match mode {
        ResponseMode::ToolCalls => format!(
            "{}\n\n{}\n\nIf you cannot use tools, reply with the payload instead.\n{}",
            BUILDER_TOOLS_SYSTEM,
            EDIT_RULES,
            wire_shape(format)
        ),
        ResponseMode::PatchJson => format!(
            "{}\n\n{}\n\n{}\n\n{}",
            BUILDER_PATCH_SYSTEM,
            wire_shape(format),
            EDIT_RULES,
            CONTEXT_REQUEST_RULE
        ),
        ResponseMode::Freeform => format!(
            "{}\n\n{}\n\n{}",
            BUILDER_FREEFORM_SYSTEM, EDIT_RULES, CONTEXT_REQUEST_RULE
        ),
    }
}

/// System prompt for schema-only regeneration steps.
pub fn schema_only_system(format: PatchFormat) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        SCHEMA_ONLY_SYSTEM,
        wire_shape(format),
        EDIT_RULES
    )
}

pub fn interpreter_system(format: PatchFormat) -> String {
    format!("{}\n\n{}", INTERPRETER_SYSTEM, wire_shape(format))
}

/// Repair guidance for the previous failure, appended to schema-only prompts.
pub fn format_repair_guidance(message: &str, format: PatchFormat) -> String {
    let msg = message.to_ascii_lowercase();
    let mut bullets: Vec<&str> = Vec::new();

    if msg.contains("search block not found") || msg.contains("not found in") {
        bullets.push("Your search text does not exist verbatim in the file.");
        bullets.push("Return the complete new content of each file you change instead of fragments.");
    } else if msg.contains("matches") && msg.contains("times") {
        bullets.push("Your search text matched several places.");
        bullets.push("Include enough surrounding lines to make it unique.");
    } else if msg.contains("placeholder") || msg.contains("ellipsis") {
        bullets.push("Your payload contained placeholder text such as `...` or TODO markers.");
        bullets.push("Copy exact code and write complete replacements.");
    } else if msg.contains("delete") {
        bullets.push("The plan does not call for deleting files. Do not use delete actions.");
    } else if msg.contains("top-level") || msg.contains("missing") || msg.contains("array") {
        bullets.push("Your payload did not have the required top-level shape.");
        bullets.push("Use exactly the key shown below and nothing else.");
    } else if msg.contains("json") || msg.contains("prose") {
        bullets.push("Your answer was not a single valid JSON object.");
        bullets.push("Do not surround the JSON with prose or commentary.");
    } else {
        bullets.push("Follow the output shape exactly.");
    }

    if format == PatchFormat::FileWrites {
        bullets.push("Every `content` value must be the entire file.");
    }

    let bullet_text = bullets
        .into_iter()
        .map(|b| format!("- {}", b))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "IMPORTANT: Your previous payload could not be applied.\nError:\n{}\n\nFix it:\n{}",
        message, bullet_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_json_system_names_only_its_shape() {
        let prompt = builder_system(ResponseMode::PatchJson, PatchFormat::FileWrites);
        assert!(prompt.contains(r#"{"files": ["#));
        assert!(!prompt.contains(r#"{"patches": ["#));
        assert!(prompt.contains("needs_context"));
    }

    #[test]
    fn test_repair_guidance_for_search_miss_suggests_full_files() {
        let guidance = format_repair_guidance(
            "search block not found in src/a.rs",
            PatchFormat::FileWrites,
        );
        assert!(guidance.contains("complete new content"));
        assert!(guidance.contains("entire file"));
    }

    #[test]
    fn test_repair_guidance_for_placeholder() {
        let guidance =
            format_repair_guidance("patch 1: placeholder content", PatchFormat::SearchReplace);
        assert!(guidance.contains("placeholder text"));
        assert!(!guidance.contains("entire file"));
    }
}
