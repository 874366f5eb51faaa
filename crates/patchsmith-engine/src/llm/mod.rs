pub mod agentic;
pub mod client;
pub mod grammar;
pub mod models;
pub mod prompts;
pub mod provider;
pub mod tools;

pub use agentic::{run_tool_loop, ToolLoopConfig, ToolLoopOutcome, ToolLoopTimedOut};
pub use client::HttpProvider;
pub use models::Usage;
pub use provider::{
    is_tools_unsupported, ChatMessage, CompletionRequest, CompletionResponse, ModelProvider,
    ProviderFuture, ResponseFormat, ToolsUnsupported,
};
