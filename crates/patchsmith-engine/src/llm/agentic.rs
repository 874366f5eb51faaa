//! Bounded tool-calling loop.

use super::models::{merge_usage, Usage};
use super::provider::{ChatMessage, CompletionRequest, ModelProvider, ResponseFormat};
use super::tools::{get_tool_definitions, is_edit_tool, FunctionCall, ToolCall, ToolSession};
use patchsmith_core::patch::PatchAction;
use patchsmith_core::ContextRequest;
use std::path::Path;
use std::time::Duration;

/// Retry budget for empty responses (no content and no tool calls).
const EMPTY_RESPONSE_MAX_RETRIES: u32 = 2;

const FINAL_INSTRUCTION: &str =
    "You've gathered enough context. Finish now: stage your edits with the edit tools or reply with the patch JSON. No more exploration.";

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_iterations: usize,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            timeout: Duration::from_secs(180),
            max_tokens: 8192,
            temperature: 0.2,
        }
    }
}

/// What a tool-enabled turn produced.
#[derive(Debug, Default)]
pub struct ToolLoopOutcome {
    /// Final assistant text.
    pub content: String,
    /// Edit actions staged through edit tools, in call order.
    pub staged: Vec<PatchAction>,
    pub context_request: Option<ContextRequest>,
    pub usage: Option<Usage>,
    pub iterations: usize,
    pub tool_calls_executed: usize,
    pub edit_calls: usize,
}

/// The loop hit its wall-clock budget before the model finished.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool loop timed out after {0:?}")]
pub struct ToolLoopTimedOut(pub Duration);

/// Run a tool-enabled conversation until the model stops calling tools, asks for
/// context, or the iteration cap is reached (then one final call without tools).
///
/// Wrapped in a wall-clock timeout; on expiry nothing staged is returned.
pub async fn run_tool_loop(
    provider: &dyn ModelProvider,
    root: &Path,
    messages: Vec<ChatMessage>,
    config: &ToolLoopConfig,
) -> anyhow::Result<ToolLoopOutcome> {
    match tokio::time::timeout(config.timeout, tool_loop(provider, root, messages, config)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::Error::new(ToolLoopTimedOut(config.timeout))),
    }
}

async fn tool_loop(
    provider: &dyn ModelProvider,
    root: &Path,
    mut messages: Vec<ChatMessage>,
    config: &ToolLoopConfig,
) -> anyhow::Result<ToolLoopOutcome> {
    let tools = get_tool_definitions();
    let mut session = ToolSession::new(root);
    let mut total_usage: Option<Usage> = None;
    let mut iteration = 0usize;
    let mut edit_calls = 0usize;
    let mut empty_response_retries: u32 = 0;

    loop {
        iteration += 1;
        if config.max_iterations > 0 && iteration > config.max_iterations {
            break;
        }

        let request = CompletionRequest {
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens: config.max_tokens,
            temperature: Some(config.temperature),
            response_format: ResponseFormat::Plain,
            stream: false,
        };
        let response = provider.complete(request).await?;
        total_usage = merge_usage(total_usage, response.usage.clone());

        if !response.tool_calls.is_empty() {
            messages.push(ChatMessage::assistant_tool_calls(
                Some(response.content.clone()).filter(|c| !c.is_empty()),
                response.tool_calls.clone(),
            ));
            for tc in &response.tool_calls {
                if is_edit_tool(&tc.function.name) {
                    edit_calls += 1;
                }
                let call = ToolCall {
                    id: tc.id.clone(),
                    function: FunctionCall {
                        name: tc.function.name.clone(),
                        arguments: tc.function.arguments.clone(),
                    },
                };
                let result = session.execute(&call);
                tracing::debug!(tool = %tc.function.name, iteration, "executed tool call");
                messages.push(ChatMessage::tool_result(result.tool_call_id, result.content));
            }

            if session.context_request().is_some() {
                return Ok(finish(session, String::new(), total_usage, iteration, edit_calls));
            }
            continue;
        }

        if response.content.trim().is_empty() {
            if empty_response_retries < EMPTY_RESPONSE_MAX_RETRIES {
                empty_response_retries += 1;
                iteration = iteration.saturating_sub(1);
                let delay_ms = 250u64 * (1 << empty_response_retries);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                continue;
            }
            if session.staged().is_empty() {
                return Err(anyhow::anyhow!(
                    "Model returned empty response. This may be due to rate limiting or an API issue. Try again."
                ));
            }
        }

        return Ok(finish(
            session,
            response.content,
            total_usage,
            iteration,
            edit_calls,
        ));
    }

    // Iteration cap reached: one final call without tools.
    messages.push(ChatMessage::user(FINAL_INSTRUCTION));
    let request = CompletionRequest {
        messages,
        tools: Vec::new(),
        max_tokens: config.max_tokens,
        temperature: None,
        response_format: ResponseFormat::Plain,
        stream: false,
    };
    let response = provider.complete(request).await?;
    total_usage = merge_usage(total_usage, response.usage.clone());
    tracing::debug!(
        iterations = config.max_iterations,
        "tool loop hit iteration cap; used final no-tools response"
    );
    Ok(finish(
        session,
        response.content,
        total_usage,
        config.max_iterations,
        edit_calls,
    ))
}

fn finish(
    session: ToolSession,
    content: String,
    usage: Option<Usage>,
    iterations: usize,
    edit_calls: usize,
) -> ToolLoopOutcome {
    let tool_calls_executed = session.executed();
    let (staged, context_request) = session.into_parts();
    ToolLoopOutcome {
        content,
        staged,
        context_request,
        usage,
        iterations,
        tool_calls_executed,
        edit_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{
        CompletionResponse, FunctionCallMessage, ProviderFuture, ToolCallMessage,
    };
    use patchsmith_core::ProviderCapabilities;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<CompletionResponse>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<CompletionResponse>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }

        fn complete<'a>(&'a self, request: CompletionRequest) -> ProviderFuture<'a> {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            Box::pin(async move { reply.ok_or_else(|| anyhow::anyhow!("script exhausted")) })
        }
    }

    fn tool_reply(name: &str, args: serde_json::Value) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCallMessage {
                id: format!("call_{}", name),
                call_type: "function".to_string(),
                function: FunctionCallMessage {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
                cost: None,
            }),
        }
    }

    fn text_reply(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.to_string(),
            ..CompletionResponse::default()
        }
    }

    #[tokio::test]
    async fn test_loop_stages_edits_and_merges_usage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        let provider = Scripted::new(vec![
            tool_reply("read_file", serde_json::json!({"path": "a.rs"})),
            tool_reply(
                "replace_in_file",
                serde_json::json!({"path": "a.rs", "search": "fn a() {}", "replace": "fn b() {}"}),
            ),
            text_reply("Done."),
        ]);
        let outcome = run_tool_loop(
            &provider,
            dir.path(),
            vec![ChatMessage::user("go")],
            &ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.content, "Done.");
        assert_eq!(outcome.staged.len(), 1);
        assert_eq!(outcome.edit_calls, 1);
        assert_eq!(outcome.tool_calls_executed, 2);
        assert_eq!(outcome.usage.unwrap().total_tokens, 24);

        let requests = provider.requests.lock().unwrap();
        let last = requests.last().unwrap();
        assert_eq!(last.messages.last().unwrap().role, crate::llm::provider::Role::Tool);
    }

    #[tokio::test]
    async fn test_loop_stops_on_context_request() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Scripted::new(vec![
            tool_reply(
                "request_context",
                serde_json::json!({"reason": "unclear", "files": ["src/auth.rs"]}),
            ),
            text_reply("never reached"),
        ]);
        let outcome = run_tool_loop(
            &provider,
            dir.path(),
            vec![ChatMessage::user("go")],
            &ToolLoopConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome.context_request.unwrap().files,
            vec!["src/auth.rs".to_string()]
        );
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_makes_final_call_without_tools_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Scripted::new(vec![
            tool_reply("list_files", serde_json::json!({})),
            tool_reply("list_files", serde_json::json!({})),
            text_reply(r#"{"patches":[]}"#),
        ]);
        let config = ToolLoopConfig {
            max_iterations: 2,
            ..ToolLoopConfig::default()
        };
        let outcome = run_tool_loop(&provider, dir.path(), vec![ChatMessage::user("go")], &config)
            .await
            .unwrap();
        assert_eq!(outcome.content, r#"{"patches":[]}"#);
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].tools.is_empty());
    }

    #[tokio::test]
    async fn test_loop_times_out() {
        struct Slow;
        impl ModelProvider for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn capabilities(&self) -> ProviderCapabilities {
                ProviderCapabilities::default()
            }
            fn complete<'a>(&'a self, _request: CompletionRequest) -> ProviderFuture<'a> {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(CompletionResponse::default())
                })
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let config = ToolLoopConfig {
            timeout: Duration::from_millis(20),
            ..ToolLoopConfig::default()
        };
        let err = run_tool_loop(&Slow, dir.path(), vec![ChatMessage::user("go")], &config)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ToolLoopTimedOut>().is_some());
    }
}
