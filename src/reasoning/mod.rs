//! Reasoning backend seam.
//!
//! Every call goes through [`ReasoningGateway`], which applies the rate
//! limiter and the retry policy before touching a backend.

pub mod http;
pub mod retry;

pub use http::HttpBackend;
pub use retry::{ReasoningGateway, RetryPolicy};

use crate::tools::ToolDefinition;
use crate::types::{ChatMessage, RoleLevel, ToolCall, ToolResult};
use async_trait::async_trait;

/// How a failed reasoning call is handled.
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    /// Rate limited or temporarily unavailable. Retried with backoff.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),
    /// Out of balance or quota. Reported once, never retried.
    #[error("terminal upstream failure: {0}")]
    TerminalUpstream(String),
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl ReasoningError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }
}

/// A tool call the model made and what it returned.
#[derive(Debug, Clone)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub result: ToolResult,
}

#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub input: String,
    pub identity: String,
    pub role: RoleLevel,
    /// Human-readable local time for the prompt.
    pub time_context: String,
    pub tools: Vec<ToolDefinition>,
    /// Tool rounds already completed for this input.
    pub exchanges: Vec<ToolExchange>,
}

#[derive(Debug, Clone, Default)]
pub struct ReasoningOutput {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Fixed service text rather than a model answer. Sent as is, without
    /// the reply guard.
    pub notice: bool,
}

impl ReasoningOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            notice: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError>;
}
