//! Secondary model call that re-derives a valid payload from unusable output.

use crate::error::FailureClass;
use crate::llm::models::Usage;
use crate::llm::prompts::interpreter_system;
use crate::llm::{grammar, ChatMessage, CompletionRequest, ModelProvider, ResponseFormat};
use crate::patch::parse::{parse_payload, ParseContext, ParseError, ParseMode};
use patchsmith_core::patch::{is_placeholder_text, PatchFormat, PatchPayload};
use patchsmith_core::Plan;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// What one interpreter call produced. `result` is the lenient parse of `content`.
#[derive(Debug)]
pub struct InterpreterOutput {
    pub result: Result<PatchPayload, ParseError>,
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Clone)]
pub struct Interpreter {
    provider: Arc<dyn ModelProvider>,
    max_tokens: u32,
    temperature: f32,
}

impl Interpreter {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            max_tokens: 8192,
            temperature: 0.0,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Ask the interpreter model to restate `raw` as a `format` payload.
    ///
    /// Transport failures are `Err`; a reply that still does not parse is
    /// reported through `InterpreterOutput::result`.
    pub async fn reinterpret(
        &self,
        raw: &str,
        format: PatchFormat,
        plan: &Plan,
        ctx: ParseContext,
    ) -> anyhow::Result<InterpreterOutput> {
        let caps = self.provider.capabilities();
        let response_format = if caps.json_schema {
            ResponseFormat::JsonSchema {
                name: format!("{}_payload", format.label()),
                schema: grammar::json_schema_for(format),
            }
        } else {
            ResponseFormat::JsonObject
        };

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(interpreter_system(format)),
                ChatMessage::user(interpreter_user_prompt(raw, plan)),
            ],
            tools: Vec::new(),
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
            response_format,
            stream: false,
        };
        let response = self.provider.complete(request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            %format,
            chars = response.content.len(),
            "interpreter replied"
        );

        Ok(InterpreterOutput {
            result: parse_payload(&response.content, format, ParseMode::Lenient, ctx),
            content: response.content,
            usage: response.usage,
        })
    }
}

fn interpreter_user_prompt(raw: &str, plan: &Plan) -> String {
    let mut allowed: Vec<&str> = plan
        .target_files
        .iter()
        .chain(plan.create_files.iter())
        .map(String::as_str)
        .collect();
    allowed.dedup();
    let allowed = if allowed.is_empty() {
        "(any file named in the draft)".to_string()
    } else {
        allowed.join("\n")
    };
    format!(
        "ALLOWED FILES:\n{}\n\nDRAFT:\n{}\n\nReturn the JSON payload only.",
        allowed, raw
    )
}

fn action_verb_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(replace|replaces|replacing|change|changes|update|updates|modify|modifies|edit|edits|add|adds|insert|inserts|create|creates|rewrite|rewrites|remove|removes|delete|deletes|rename|renames)\b")
            .expect("static action verb regex")
    })
}

fn json_intent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""(patches|files|action|path|file|search_block|replace_block|content)"\s*:"#)
            .expect("static json intent regex")
    })
}

/// Whether a failed attempt is worth one interpreter call.
///
/// Only syntax failures qualify, and only when the output plausibly carries patch
/// intent: embedded payload-like JSON, or prose with an action verb and a path
/// the plan already names.
pub fn interpreter_eligible(class: FailureClass, raw: &str, plan: &Plan) -> bool {
    if class != FailureClass::RecoverableSyntax {
        return false;
    }
    if is_placeholder_text(raw) {
        return false;
    }
    if raw.contains('{') && json_intent_re().is_match(raw) {
        return true;
    }
    if !action_verb_re().is_match(raw) {
        return false;
    }
    plan.target_files
        .iter()
        .chain(plan.create_files.iter())
        .map(|p| p.trim().trim_start_matches("./"))
        .filter(|p| !p.is_empty())
        .any(|p| raw.contains(p))
}
