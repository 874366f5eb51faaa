//! The opaque request/response capability the runner drives.

use super::models::Usage;
use super::tools::ToolDefinition;
use futures::future::BoxFuture;
use patchsmith_core::ProviderCapabilities;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallMessage>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCallMessage,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallMessage {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// Output constraint requested from the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseFormat {
    #[default]
    Plain,
    JsonObject,
    JsonSchema {
        name: String,
        schema: serde_json::Value,
    },
    /// GBNF grammar-constrained sampling.
    Grammar(String),
}

impl ResponseFormat {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseFormat::Plain => "plain",
            ResponseFormat::JsonObject => "json_object",
            ResponseFormat::JsonSchema { .. } => "json_schema",
            ResponseFormat::Grammar(_) => "grammar",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub response_format: ResponseFormat,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallMessage>,
    pub usage: Option<Usage>,
}

/// The provider rejected a request because it cannot do tool calling.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider does not support tool calling: {0}")]
pub struct ToolsUnsupported(pub String);

fn tools_unsupported_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(tools?|tool[_ ]calls?|tool_choice|function[_ ]calling)[^.\n]{0,40}(not supported|unsupported|not available|is not enabled)|(does not|doesn't) support (tools|tool[_ ]calls?|function[_ ]calling)",
        )
        .expect("static tools-unsupported regex")
    })
}

/// Whether `err` means tool calling is unavailable, typed first, wording second.
pub fn is_tools_unsupported(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<ToolsUnsupported>().is_some() {
        return true;
    }
    tools_unsupported_re().is_match(&err.to_string())
}

pub type ProviderFuture<'a> = BoxFuture<'a, anyhow::Result<CompletionResponse>>;

/// A chat-completion capability. Implementations own transport, auth and retries.
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    fn complete<'a>(&'a self, request: CompletionRequest) -> ProviderFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_tools_unsupported_is_detected() {
        let err = anyhow::Error::new(ToolsUnsupported("400".to_string()));
        assert!(is_tools_unsupported(&err));
    }

    #[test]
    fn test_tools_unsupported_wording_is_detected() {
        let err = anyhow::anyhow!("API error 400: tool_choice is not supported by this model");
        assert!(is_tools_unsupported(&err));
        let err = anyhow::anyhow!("This endpoint does not support tools");
        assert!(is_tools_unsupported(&err));
        let err = anyhow::anyhow!("Rate limited after 3 retries");
        assert!(!is_tools_unsupported(&err));
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = ChatMessage::tool_result("call_1", "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert!(json.get("tool_calls").is_none());
    }
}
