//! Raw model text to a validated `PatchPayload`. Never touches the filesystem.

use crate::error::FailureClass;
use patchsmith_core::patch::{
    contains_elided_region, is_placeholder_text, FileWrite, PatchAction, PatchFormat, PatchPayload,
};
use patchsmith_core::ContextRequest;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// The wire contract: one JSON object, optionally wholly fenced.
    Strict,
    /// Salvage the first usable JSON object from surrounding prose.
    Lenient,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseContext {
    /// Whether the plan expresses deletion intent.
    pub deletion_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    EmptyOutput,
    InvalidJson,
    MixedContent,
    NotAnObject,
    MissingArrayKey,
    WrongArrayType,
    UnexpectedTopLevelKey,
    EmptyArray,
    EntryNotObject,
    InvalidAction,
    MissingField,
    PlaceholderContent,
    DisallowedDelete,
}

impl ParseErrorKind {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ParseErrorKind::EmptyOutput
            | ParseErrorKind::NotAnObject
            | ParseErrorKind::MissingArrayKey
            | ParseErrorKind::WrongArrayType
            | ParseErrorKind::UnexpectedTopLevelKey => FailureClass::SchemaDefinition,
            ParseErrorKind::InvalidJson | ParseErrorKind::MixedContent => {
                FailureClass::RecoverableSyntax
            }
            ParseErrorKind::EmptyArray
            | ParseErrorKind::EntryNotObject
            | ParseErrorKind::InvalidAction
            | ParseErrorKind::MissingField
            | ParseErrorKind::PlaceholderContent
            | ParseErrorKind::DisallowedDelete => FailureClass::StructuralContent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Zero-based entry index, for entry-level errors.
    pub entry: Option<usize>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entry: None,
        }
    }

    fn at(kind: ParseErrorKind, entry: usize, message: impl std::fmt::Display) -> Self {
        Self {
            kind,
            message: format!("entry {}: {}", entry + 1, message),
            entry: Some(entry),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.kind.failure_class()
    }
}

/// Parse `raw` as a payload of `format`. Every declared entry is kept or the whole
/// payload is rejected.
pub fn parse_payload(
    raw: &str,
    format: PatchFormat,
    mode: ParseMode,
    ctx: ParseContext,
) -> Result<PatchPayload, ParseError> {
    let value = match mode {
        ParseMode::Strict => strict_json(raw)?,
        ParseMode::Lenient => lenient_json(raw, format)?,
    };
    let Value::Object(object) = value else {
        return Err(ParseError::new(
            ParseErrorKind::NotAnObject,
            "payload is not a JSON object",
        ));
    };
    let entries = top_level_array(&object, format, mode)?;

    match format {
        PatchFormat::SearchReplace => entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| parse_action(idx, entry, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(PatchPayload::Patches),
        PatchFormat::FileWrites => entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| parse_file_write(idx, entry))
            .collect::<Result<Vec<_>, _>>()
            .map(PatchPayload::Files),
    }
}

/// A `{"needs_context": true, ...}` signal anywhere in `raw` (fenced or not).
pub fn detect_context_request(raw: &str) -> Option<ContextRequest> {
    if !raw.contains("needs_context") {
        return None;
    }
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, raw);
    if let Some(stripped) = strip_markdown_fences(raw) {
        push_unique_candidate(&mut candidates, stripped);
    }
    for extracted in extract_json_candidates(raw, 8) {
        push_unique_candidate(&mut candidates, extracted);
    }
    candidates.into_iter().find_map(|candidate| {
        let value: Value = serde_json::from_str(&candidate).ok()?;
        let object = value.as_object()?;
        if object.get("needs_context").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        serde_json::from_value::<ContextRequest>(value).ok()
    })
}

fn strict_json(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::new(ParseErrorKind::EmptyOutput, "empty output"));
    }

    let body = if trimmed.starts_with("```") {
        let body = strip_markdown_fences(trimmed).ok_or_else(|| {
            ParseError::new(ParseErrorKind::InvalidJson, "unterminated markdown fence")
        })?;
        // The fence must wrap the whole output.
        if !trimmed.ends_with("```") {
            return Err(ParseError::new(
                ParseErrorKind::MixedContent,
                "prose after the fenced payload; return the JSON object only",
            ));
        }
        body
    } else {
        trimmed.to_string()
    };
    if body.is_empty() {
        return Err(ParseError::new(ParseErrorKind::EmptyOutput, "empty fenced block"));
    }

    if !body.starts_with('{') && !body.starts_with('[') {
        return Err(if body.contains('{') {
            ParseError::new(
                ParseErrorKind::MixedContent,
                "prose before the JSON payload; return the JSON object only",
            )
        } else {
            ParseError::new(ParseErrorKind::InvalidJson, "output is not JSON")
        });
    }

    serde_json::from_str::<Value>(&body).map_err(|err| {
        let trailing = extract_balanced_json_from(&body, 0)
            .map(|json| json.len() < body.len())
            .unwrap_or(false);
        if trailing {
            ParseError::new(
                ParseErrorKind::MixedContent,
                "prose after the JSON payload; return the JSON object only",
            )
        } else {
            ParseError::new(ParseErrorKind::InvalidJson, format!("invalid JSON: {}", err))
        }
    })
}

fn lenient_json(raw: &str, format: PatchFormat) -> Result<Value, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::new(ParseErrorKind::EmptyOutput, "empty output"));
    }

    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, raw);
    if let Some(stripped) = strip_markdown_fences(raw) {
        push_unique_candidate(&mut candidates, stripped);
    }
    let mut idx = 0usize;
    while idx < candidates.len() {
        let current = candidates[idx].clone();
        for extracted in extract_json_candidates(&current, 4) {
            push_unique_candidate(&mut candidates, extracted);
        }
        idx += 1;
    }

    let mut first_object: Option<Value> = None;
    let mut last_err: Option<String> = None;
    for candidate in candidates {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                let has_key = value
                    .as_object()
                    .map(|o| o.contains_key(format.array_key()))
                    .unwrap_or(false);
                if has_key {
                    return Ok(value);
                }
                if first_object.is_none() && value.is_object() {
                    first_object = Some(value);
                }
            }
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    first_object.ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::InvalidJson,
            format!(
                "no JSON object found: {}",
                last_err.unwrap_or_else(|| "unknown parse error".to_string())
            ),
        )
    })
}

fn top_level_array<'a>(
    object: &'a Map<String, Value>,
    format: PatchFormat,
    mode: ParseMode,
) -> Result<&'a Vec<Value>, ParseError> {
    let key = format.array_key();
    let other = format.other().array_key();

    if object.contains_key(other) {
        return Err(ParseError::new(
            ParseErrorKind::UnexpectedTopLevelKey,
            format!(
                "unexpected top-level key `{}` for {} format; use `{}`",
                other, format, key
            ),
        ));
    }
    let Some(value) = object.get(key) else {
        return Err(ParseError::new(
            ParseErrorKind::MissingArrayKey,
            format!("missing top-level `{}` array", key),
        ));
    };
    if mode == ParseMode::Strict {
        if let Some(extra) = object.keys().find(|k| k.as_str() != key) {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedTopLevelKey,
                format!("unexpected top-level key `{}`; only `{}` is allowed", extra, key),
            ));
        }
    }
    let Value::Array(entries) = value else {
        return Err(ParseError::new(
            ParseErrorKind::WrongArrayType,
            format!("top-level `{}` must be an array", key),
        ));
    };
    if entries.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::EmptyArray,
            format!("top-level `{}` array is empty", key),
        ));
    }
    Ok(entries)
}

fn entry_object(idx: usize, entry: &Value) -> Result<&Map<String, Value>, ParseError> {
    entry
        .as_object()
        .ok_or_else(|| ParseError::at(ParseErrorKind::EntryNotObject, idx, "not an object"))
}

fn string_field<'a>(
    idx: usize,
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ParseError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ParseError::at(
            ParseErrorKind::MissingField,
            idx,
            format_args!("`{}` must be a string", field),
        )),
        None => Err(ParseError::at(
            ParseErrorKind::MissingField,
            idx,
            format_args!("missing `{}`", field),
        )),
    }
}

fn path_field(idx: usize, object: &Map<String, Value>, field: &str) -> Result<String, ParseError> {
    let path = string_field(idx, object, field)?;
    if path.trim().is_empty() {
        return Err(ParseError::at(
            ParseErrorKind::MissingField,
            idx,
            format_args!("`{}` is empty", field),
        ));
    }
    Ok(path.to_string())
}

fn parse_action(idx: usize, entry: &Value, ctx: ParseContext) -> Result<PatchAction, ParseError> {
    let object = entry_object(idx, entry)?;
    let action = match object.get("action") {
        Some(Value::String(action)) => action.as_str(),
        Some(other) => {
            return Err(ParseError::at(
                ParseErrorKind::InvalidAction,
                idx,
                format_args!("invalid action {}", other),
            ))
        }
        None => {
            return Err(ParseError::at(
                ParseErrorKind::MissingField,
                idx,
                "missing `action`",
            ))
        }
    };

    match action {
        "create" => {
            let file = path_field(idx, object, "file")?;
            let content = string_field(idx, object, "content")?;
            check_content(idx, "content", content)?;
            Ok(PatchAction::Create {
                file,
                content: content.to_string(),
            })
        }
        "replace" => {
            let file = path_field(idx, object, "file")?;
            let search = string_field(idx, object, "search_block")?;
            let replace = string_field(idx, object, "replace_block")?;
            check_search_block(idx, search)?;
            check_replacement(idx, replace)?;
            Ok(PatchAction::Replace {
                file,
                search_block: search.to_string(),
                replace_block: replace.to_string(),
            })
        }
        "delete" => {
            let file = path_field(idx, object, "file")?;
            if !ctx.deletion_allowed {
                return Err(ParseError::at(
                    ParseErrorKind::DisallowedDelete,
                    idx,
                    format_args!("delete of {} but the plan does not call for deleting files", file),
                ));
            }
            Ok(PatchAction::Delete { file })
        }
        other => Err(ParseError::at(
            ParseErrorKind::InvalidAction,
            idx,
            format_args!(
                "invalid action `{}` (expected create, replace or delete)",
                other
            ),
        )),
    }
}

fn parse_file_write(idx: usize, entry: &Value) -> Result<FileWrite, ParseError> {
    let object = entry_object(idx, entry)?;
    let path = path_field(idx, object, "path")?;
    let content = string_field(idx, object, "content")?;
    check_content(idx, "content", content)?;
    Ok(FileWrite {
        path,
        content: content.to_string(),
    })
}

/// Full-file content must not be empty or placeholder-only.
pub(crate) fn check_content(idx: usize, field: &str, content: &str) -> Result<(), ParseError> {
    if is_placeholder_text(content) {
        return Err(ParseError::at(
            ParseErrorKind::PlaceholderContent,
            idx,
            format_args!("placeholder content in `{}`", field),
        ));
    }
    Ok(())
}

/// Search anchors must be real text: not empty, not a sentinel, no elided regions.
pub(crate) fn check_search_block(idx: usize, search: &str) -> Result<(), ParseError> {
    if is_placeholder_text(search) {
        return Err(ParseError::at(
            ParseErrorKind::PlaceholderContent,
            idx,
            "placeholder content in `search_block`",
        ));
    }
    if contains_elided_region(search) {
        return Err(ParseError::at(
            ParseErrorKind::PlaceholderContent,
            idx,
            "placeholder content in `search_block` (contains an ellipsis)",
        ));
    }
    Ok(())
}

/// Replacement text must be real text: not empty or whitespace, not a sentinel.
pub(crate) fn check_replacement(idx: usize, replace: &str) -> Result<(), ParseError> {
    if replace.trim().is_empty() {
        return Err(ParseError::at(
            ParseErrorKind::PlaceholderContent,
            idx,
            "empty `replace_block`; use a `files` rewrite to remove text",
        ));
    }
    if is_placeholder_text(replace) {
        return Err(ParseError::at(
            ParseErrorKind::PlaceholderContent,
            idx,
            "placeholder content in `replace_block`",
        ));
    }
    Ok(())
}

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = if let Some(newline_idx) = without_open.find('\n') {
        &without_open[newline_idx + 1..]
    } else {
        without_open
    };
    let end_idx = after_header.rfind("```")?;
    Some(after_header[..end_idx].trim().to_string())
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    if max_candidates == 0 {
        return out;
    }
    for (idx, ch) in content.char_indices() {
        if ch == '{' {
            if let Some(candidate) = extract_balanced_json_from(content, idx) {
                push_unique_candidate(&mut out, candidate);
                if out.len() >= max_candidates {
                    break;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: ParseMode = ParseMode::Strict;

    fn ctx() -> ParseContext {
        ParseContext::default()
    }

    fn kind_of(raw: &str, format: PatchFormat) -> ParseErrorKind {
        parse_payload(raw, format, STRICT, ctx()).unwrap_err().kind
    }

    #[test]
    fn test_ellipsis_search_block_is_placeholder_content() {
        let raw = r#"{"patches":[{"action":"replace","file":"src/a.ts","search_block":"...","replace_block":"x"}]}"#;
        let err = parse_payload(raw, PatchFormat::SearchReplace, STRICT, ctx()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::PlaceholderContent);
        assert_eq!(err.entry, Some(0));
        assert_eq!(err.class(), FailureClass::StructuralContent);
    }

    #[test]
    fn test_valid_search_replace_payload() {
        let raw = r#"{"patches":[
            {"action":"replace","file":"src/a.ts","search_block":"const a = 1;","replace_block":"const a = 2;"},
            {"action":"create","file":"src/b.ts","content":"export const b = 1;\n"}
        ]}"#;
        let payload = parse_payload(raw, PatchFormat::SearchReplace, STRICT, ctx()).unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.target_paths(), vec!["src/a.ts", "src/b.ts"]);
    }

    #[test]
    fn test_fenced_payload_is_accepted() {
        let raw = "```json\n{\"files\":[{\"path\":\"a.rs\",\"content\":\"fn a() {}\\n\"}]}\n```";
        let payload = parse_payload(raw, PatchFormat::FileWrites, STRICT, ctx()).unwrap();
        assert_eq!(payload.format(), PatchFormat::FileWrites);
    }

    #[test]
    fn test_prose_after_closing_fence_is_mixed_content() {
        let raw = "```json\n{\"files\":[{\"path\":\"a.rs\",\"content\":\"fn a() {}\\n\"}]}\n```\nLet me know if you need anything else.";
        assert_eq!(kind_of(raw, PatchFormat::FileWrites), ParseErrorKind::MixedContent);

        let lenient = parse_payload(raw, PatchFormat::FileWrites, ParseMode::Lenient, ctx()).unwrap();
        assert_eq!(lenient.len(), 1);
    }

    #[test]
    fn test_prose_around_json_is_mixed_content_in_strict_mode() {
        let raw = "Here is the patch:\n{\"files\":[{\"path\":\"a.rs\",\"content\":\"x\"}]}";
        assert_eq!(kind_of(raw, PatchFormat::FileWrites), ParseErrorKind::MixedContent);
        let raw = "{\"files\":[{\"path\":\"a.rs\",\"content\":\"x\"}]}\nHope this helps!";
        assert_eq!(kind_of(raw, PatchFormat::FileWrites), ParseErrorKind::MixedContent);
    }

    #[test]
    fn test_lenient_mode_salvages_embedded_payload() {
        let raw = "Here is the patch:\n{\"files\":[{\"path\":\"a.rs\",\"content\":\"x\"}]}\nDone.";
        let payload =
            parse_payload(raw, PatchFormat::FileWrites, ParseMode::Lenient, ctx()).unwrap();
        assert_eq!(payload.target_paths(), vec!["a.rs"]);
    }

    #[test]
    fn test_format_purity_rejects_the_other_key() {
        let files = r#"{"files":[{"path":"a.rs","content":"x"}]}"#;
        assert_eq!(
            kind_of(files, PatchFormat::SearchReplace),
            ParseErrorKind::UnexpectedTopLevelKey
        );
        let patches = r#"{"patches":[{"action":"delete","file":"a.rs"}]}"#;
        assert_eq!(
            kind_of(patches, PatchFormat::FileWrites),
            ParseErrorKind::UnexpectedTopLevelKey
        );
        let both = r#"{"patches":[],"files":[]}"#;
        assert_eq!(
            kind_of(both, PatchFormat::SearchReplace),
            ParseErrorKind::UnexpectedTopLevelKey
        );
        let extra = r#"{"patches":[{"action":"delete","file":"a.rs"}],"note":"x"}"#;
        assert_eq!(
            kind_of(extra, PatchFormat::SearchReplace),
            ParseErrorKind::UnexpectedTopLevelKey
        );
    }

    #[test]
    fn test_schema_definition_errors() {
        assert_eq!(kind_of("", PatchFormat::SearchReplace), ParseErrorKind::EmptyOutput);
        assert_eq!(kind_of("[1,2]", PatchFormat::SearchReplace), ParseErrorKind::NotAnObject);
        assert_eq!(
            kind_of(r#"{"edits":[]}"#, PatchFormat::SearchReplace),
            ParseErrorKind::MissingArrayKey
        );
        assert_eq!(
            kind_of(r#"{"patches":{}}"#, PatchFormat::SearchReplace),
            ParseErrorKind::WrongArrayType
        );
        assert_eq!(
            ParseErrorKind::MissingArrayKey.failure_class(),
            FailureClass::SchemaDefinition
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(
            kind_of(r#"{"patches":[]}"#, PatchFormat::SearchReplace),
            ParseErrorKind::EmptyArray
        );
        assert_eq!(
            kind_of(r#"{"patches":["a.rs"]}"#, PatchFormat::SearchReplace),
            ParseErrorKind::EntryNotObject
        );
        assert_eq!(
            kind_of(
                r#"{"patches":[{"action":"rename","file":"a.rs"}]}"#,
                PatchFormat::SearchReplace
            ),
            ParseErrorKind::InvalidAction
        );
        assert_eq!(
            kind_of(
                r#"{"patches":[{"action":"replace","file":"a.rs","search_block":"x"}]}"#,
                PatchFormat::SearchReplace
            ),
            ParseErrorKind::MissingField
        );
        assert_eq!(
            kind_of(r#"{"files":[{"path":"a.rs","content":"// ..."}]}"#, PatchFormat::FileWrites),
            ParseErrorKind::PlaceholderContent
        );
    }

    #[test]
    fn test_no_truncation_one_bad_entry_rejects_payload() {
        let raw = r#"{"patches":[
            {"action":"create","file":"ok.rs","content":"fn ok() {}"},
            {"action":"create","file":"bad.rs","content":"TODO"}
        ]}"#;
        let err = parse_payload(raw, PatchFormat::SearchReplace, STRICT, ctx()).unwrap_err();
        assert_eq!(err.entry, Some(1));
        assert!(err.message.starts_with("entry 2:"));
    }

    #[test]
    fn test_delete_requires_deletion_intent() {
        let raw = r#"{"patches":[{"action":"delete","file":"old.rs"}]}"#;
        assert_eq!(
            kind_of(raw, PatchFormat::SearchReplace),
            ParseErrorKind::DisallowedDelete
        );
        let allowed = ParseContext {
            deletion_allowed: true,
        };
        assert!(parse_payload(raw, PatchFormat::SearchReplace, STRICT, allowed).is_ok());
    }

    #[test]
    fn test_empty_replacement_is_placeholder_content() {
        for replace in ["", "   \n\t"] {
            let raw = serde_json::json!({"patches": [{
                "action": "replace",
                "file": "a.rs",
                "search_block": "dbg!(x);\n",
                "replace_block": replace,
            }]})
            .to_string();
            let err = parse_payload(&raw, PatchFormat::SearchReplace, STRICT, ctx()).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::PlaceholderContent);
            assert_eq!(err.entry, Some(0));
            assert!(err.message.contains("replace_block"));
        }
    }

    #[test]
    fn test_invalid_json_is_recoverable_syntax() {
        let err =
            parse_payload(r#"{"patches":[{"action":"#, PatchFormat::SearchReplace, STRICT, ctx())
                .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidJson);
        assert_eq!(err.class(), FailureClass::RecoverableSyntax);
    }

    #[test]
    fn test_detect_context_request() {
        let request =
            detect_context_request(r#"{"needs_context": true, "queries": ["auth flow"]}"#).unwrap();
        assert_eq!(request.queries, vec!["auth flow".to_string()]);

        let fenced = "I need more.\n```json\n{\"needs_context\": true, \"reason\": \"which db?\"}\n```";
        assert_eq!(detect_context_request(fenced).unwrap().reason, "which db?");

        assert!(detect_context_request(r#"{"needs_context": false}"#).is_none());
        assert!(detect_context_request(r#"{"patches": []}"#).is_none());
    }
}
