//! Fixed output constraints for the two patch wire shapes.

use super::provider::ResponseFormat;
use patchsmith_core::patch::PatchFormat;
use patchsmith_core::ProviderCapabilities;

/// GBNF for `{"patches":[...]}`.
pub const SEARCH_REPLACE_GBNF: &str = r#"root ::= "{" ws "\"patches\"" ws ":" ws "[" ws action (ws "," ws action)* ws "]" ws "}" ws
action ::= create | replace | delete
create ::= "{" ws "\"action\"" ws ":" ws "\"create\"" ws "," ws "\"file\"" ws ":" ws path ws "," ws "\"content\"" ws ":" ws text ws "}"
replace ::= "{" ws "\"action\"" ws ":" ws "\"replace\"" ws "," ws "\"file\"" ws ":" ws path ws "," ws "\"search_block\"" ws ":" ws text ws "," ws "\"replace_block\"" ws ":" ws text ws "}"
delete ::= "{" ws "\"action\"" ws ":" ws "\"delete\"" ws "," ws "\"file\"" ws ":" ws path ws "}"
path ::= "\"" char+ "\""
text ::= "\"" char+ "\""
char ::= [^"\\\x7F\x00-\x1F] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
ws ::= [ \t\n]*
"#;

/// GBNF for `{"files":[...]}`.
pub const FILE_WRITES_GBNF: &str = r#"root ::= "{" ws "\"files\"" ws ":" ws "[" ws entry (ws "," ws entry)* ws "]" ws "}" ws
entry ::= "{" ws "\"path\"" ws ":" ws path ws "," ws "\"content\"" ws ":" ws text ws "}"
path ::= "\"" char+ "\""
text ::= "\"" char+ "\""
char ::= [^"\\\x7F\x00-\x1F] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
ws ::= [ \t\n]*
"#;

pub fn grammar_for(format: PatchFormat) -> &'static str {
    match format {
        PatchFormat::SearchReplace => SEARCH_REPLACE_GBNF,
        PatchFormat::FileWrites => FILE_WRITES_GBNF,
    }
}

/// JSON schema for one wire shape, for providers with structured outputs.
pub fn json_schema_for(format: PatchFormat) -> serde_json::Value {
    match format {
        PatchFormat::SearchReplace => serde_json::json!({
            "type": "object",
            "properties": {
                "patches": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "anyOf": [
                            {
                                "type": "object",
                                "properties": {
                                    "action": { "type": "string", "enum": ["create"] },
                                    "file": { "type": "string" },
                                    "content": { "type": "string" }
                                },
                                "required": ["action", "file", "content"],
                                "additionalProperties": false
                            },
                            {
                                "type": "object",
                                "properties": {
                                    "action": { "type": "string", "enum": ["replace"] },
                                    "file": { "type": "string" },
                                    "search_block": { "type": "string" },
                                    "replace_block": { "type": "string", "minLength": 1 }
                                },
                                "required": ["action", "file", "search_block", "replace_block"],
                                "additionalProperties": false
                            },
                            {
                                "type": "object",
                                "properties": {
                                    "action": { "type": "string", "enum": ["delete"] },
                                    "file": { "type": "string" }
                                },
                                "required": ["action", "file"],
                                "additionalProperties": false
                            }
                        ]
                    }
                }
            },
            "required": ["patches"],
            "additionalProperties": false
        }),
        PatchFormat::FileWrites => serde_json::json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["path", "content"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["files"],
            "additionalProperties": false
        }),
    }
}

/// Strongest constraint the provider supports: grammar, then schema, then JSON mode.
pub fn constrained_format(format: PatchFormat, caps: &ProviderCapabilities) -> ResponseFormat {
    if caps.grammar {
        ResponseFormat::Grammar(grammar_for(format).to_string())
    } else if caps.json_schema {
        ResponseFormat::JsonSchema {
            name: format!("{}_payload", format.label()),
            schema: json_schema_for(format),
        }
    } else {
        ResponseFormat::JsonObject
    }
}
