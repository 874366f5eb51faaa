//! OpenAI-compatible chat-completions transport.

use super::models::Usage;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, ModelProvider, ProviderFuture,
    ResponseFormat, ToolCallMessage, ToolsUnsupported,
};
use super::tools::ToolDefinition;
use anyhow::anyhow;
use patchsmith_adapters::config::ProviderSettings;
use patchsmith_adapters::util::truncate;
use patchsmith_core::ProviderCapabilities;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000;
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2;
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    /// llama.cpp-style GBNF constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiErrorDetail {
    fn numeric_code(&self) -> Option<u16> {
        match &self.code {
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

fn wire_response_format(format: &ResponseFormat) -> (Option<WireResponseFormat>, Option<&str>) {
    match format {
        ResponseFormat::Plain => (None, None),
        ResponseFormat::JsonObject => (
            Some(WireResponseFormat {
                format_type: "json_object",
                json_schema: None,
            }),
            None,
        ),
        ResponseFormat::JsonSchema { name, schema } => (
            Some(WireResponseFormat {
                format_type: "json_schema",
                json_schema: Some(JsonSchemaWrapper {
                    name: name.clone(),
                    strict: true,
                    schema: schema.clone(),
                }),
            }),
            None,
        ),
        ResponseFormat::Grammar(gbnf) => (None, Some(gbnf.as_str())),
    }
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

/// Extract a retry-after hint from an error body ("retry after 12 seconds").
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    for word in text_lower[pos..].split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn map_transport_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow!("Request timed out. The provider may be overloaded; try again.")
    } else if err.is_connect() {
        anyhow!("Could not connect to the provider: {}", err)
    } else {
        anyhow!("Request failed: {}", err)
    }
}

fn mentions_tools(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("tool") || lower.contains("function call")
}

/// Create a configured HTTP client for provider requests
pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
}

/// Send a request with automatic retry for:
/// - Network errors (timeout, connection failures)
/// - Rate limits (429)
/// - Server errors (5xx)
/// - 200-with-error responses from gateways
///
/// Returns the response text on success, or an error after all retries exhausted.
pub(crate) async fn send_with_retry<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    request_body: &T,
    uses_tools: bool,
) -> anyhow::Result<String> {
    let mut last_error = String::new();
    let mut retry_count = 0;

    while retry_count <= MAX_RETRIES {
        let mut builder = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(request_body);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                last_error = err.to_string();
                if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tracing::warn!(retry = retry_count, error = %err, "provider network error; retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                    continue;
                }
                return Err(map_transport_error(err));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                last_error = err.to_string();
                if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                    continue;
                }
                return Err(map_transport_error(err));
            }
        };

        if status.is_success() {
            if let Ok(err_resp) = serde_json::from_str::<ApiErrorBody>(&text) {
                let is_retryable = err_resp
                    .error
                    .numeric_code()
                    .map(|c| c >= 500 || c == 429)
                    .unwrap_or(true);

                if is_retryable && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                    continue;
                }

                return Err(anyhow!(
                    "Provider error: {}",
                    truncate(&err_resp.error.message, 200)
                ));
            }

            return Ok(text);
        }

        last_error = text.clone();

        if status.as_u16() == 429 && retry_count < MAX_RETRIES {
            retry_count += 1;
            let retry_after = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
            tracing::warn!(retry = retry_count, retry_after, "provider rate limited; retrying");
            tokio::time::sleep(Duration::from_secs(retry_after)).await;
            continue;
        }

        if status.is_server_error() && retry_count < MAX_RETRIES {
            retry_count += 1;
            tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
            continue;
        }

        if uses_tools && matches!(status.as_u16(), 400 | 404 | 422 | 501) && mentions_tools(&text) {
            return Err(anyhow::Error::new(ToolsUnsupported(format!(
                "{}: {}",
                status,
                sanitize_api_response(&text)
            ))));
        }

        let error_msg = match status.as_u16() {
            401 | 403 => "Invalid API key. Check the key variable named in the provider settings."
                .to_string(),
            429 => format!(
                "Rate limited by the provider after {} retries. Try again in a few minutes.",
                retry_count
            ),
            500..=599 => format!(
                "Provider server error ({}). The service may be temporarily unavailable.",
                status
            ),
            _ => format!("API error {}: {}", status, sanitize_api_response(&text)),
        };
        return Err(anyhow!("{}", error_msg));
    }

    Err(anyhow!("{}", last_error))
}

/// A provider reached over HTTP.
pub struct HttpProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    capabilities: ProviderCapabilities,
}

impl HttpProvider {
    pub fn from_settings(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let base = settings.base_url.trim_end_matches('/');
        Ok(Self {
            client: create_http_client(REQUEST_TIMEOUT_SECS)?,
            url: format!("{}/chat/completions", base),
            model: settings.model.clone(),
            api_key: settings.api_key(),
            capabilities: settings.capabilities,
        })
    }

    async fn send(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let uses_tools = !request.tools.is_empty();
        if uses_tools && !self.capabilities.tool_calls {
            return Err(anyhow::Error::new(ToolsUnsupported(format!(
                "{} is configured without tool calling",
                self.model
            ))));
        }
        let (response_format, grammar) = wire_response_format(&request.response_format);
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: request.stream,
            temperature: request.temperature,
            response_format,
            grammar,
            tools: uses_tools.then_some(request.tools.as_slice()),
            tool_choice: uses_tools.then_some("auto"),
        };

        let text =
            send_with_retry(&self.client, &self.url, self.api_key.as_deref(), &body, uses_tools)
                .await?;
        parse_chat_response(&text)
    }
}

fn parse_chat_response(text: &str) -> anyhow::Result<CompletionResponse> {
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
        anyhow!(
            "Failed to parse provider response: {}\n{}",
            e,
            sanitize_api_response(text)
        )
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No response from model"))?;

    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(anyhow!("Request was refused: {}", truncate(&refusal, 200)));
    }

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        usage: parsed.usage,
    })
}

impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn complete<'a>(&'a self, request: CompletionRequest) -> ProviderFuture<'a> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_redacts_secret_looking_content() {
        assert_eq!(
            sanitize_api_response("invalid api_key sk-123"),
            "(response details redacted - may contain sensitive data)"
        );
        assert_eq!(sanitize_api_response("model not found"), "model not found");
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(3), 8);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn test_grammar_is_sent_outside_response_format() {
        let constrained = ResponseFormat::Grammar("root ::= \"x\"".into());
        let (format, grammar) = wire_response_format(&constrained);
        assert!(format.is_none());
        assert_eq!(grammar, Some("root ::= \"x\""));

        let (format, _) = wire_response_format(&ResponseFormat::JsonObject);
        let json = serde_json::to_value(format.unwrap()).unwrap();
        assert_eq!(json["type"], "json_object");
    }

    #[test]
    fn test_parse_chat_response_with_tool_calls() {
        let text = r#"{
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "read_file", "arguments": "{\"path\":\"a\"}"}}
            ]}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        }"#;
        let response = parse_chat_response(text).unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.tool_calls[0].function.name, "read_file");
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_parse_chat_response_refusal_is_error() {
        let text = r#"{"choices": [{"message": {"content": "", "refusal": "no"}}]}"#;
        assert!(parse_chat_response(text).is_err());
    }

    #[test]
    fn test_api_error_code_accepts_string_or_number() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"error": {"message": "busy", "code": 503}}"#).unwrap();
        assert_eq!(body.error.numeric_code(), Some(503));
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"error": {"message": "x", "code": "429"}}"#).unwrap();
        assert_eq!(body.error.numeric_code(), Some(429));
    }
}
