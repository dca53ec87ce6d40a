//! OpenAI-compatible chat-completions backend.
//!
//! Supports tool-use (function calling). HTTP failures are classified so
//! the gateway knows what to retry.

use super::{ReasoningBackend, ReasoningError, ReasoningOutput, ReasoningRequest};
use crate::config::schema::ReasoningConfig;
use crate::types::*;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

// -- OpenAI-compatible request/response types --------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolPayload<'a>>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct MessagePayload {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl MessagePayload {
    fn plain(role: ChatRole, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolPayload<'a> {
    r#type: &'a str,
    function: FunctionPayload<'a>,
}

#[derive(Debug, Serialize)]
struct FunctionPayload<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallPayload {
    id: String,
    r#type: String,
    function: FunctionCallPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCallPayload {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallPayload>,
}

/// Map an HTTP failure to the retry class.
fn classify_status(status: StatusCode, body: &str) -> ReasoningError {
    let lower = body.to_lowercase();
    // Some providers report exhausted quota as 429.
    if status == StatusCode::PAYMENT_REQUIRED
        || lower.contains("insufficient")
        || lower.contains("quota")
    {
        return ReasoningError::TerminalUpstream(format!("{}: {}", status, body));
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            ReasoningError::TransientUpstream(format!("{}: {}", status, body))
        }
        _ => ReasoningError::Unclassified(anyhow::anyhow!(
            "Reasoning request failed ({}): {}",
            status,
            body
        )),
    }
}

fn classify_transport(err: reqwest::Error) -> ReasoningError {
    if err.is_timeout() || err.is_connect() {
        ReasoningError::TransientUpstream(err.to_string())
    } else {
        ReasoningError::Unclassified(anyhow::Error::new(err).context("Reasoning request failed"))
    }
}

impl HttpBackend {
    pub fn new(config: &ReasoningConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            http,
        })
    }

    fn build_messages(request: &ReasoningRequest) -> Vec<MessagePayload> {
        let system = format!(
            "{}\n\nSpeaker: {} (role: {}). Local time: {}.",
            request.system_prompt, request.identity, request.role, request.time_context
        );

        let mut messages = vec![MessagePayload::plain(ChatRole::System, &system)];
        messages.extend(
            request
                .history
                .iter()
                .map(|m| MessagePayload::plain(m.role, &m.content)),
        );
        messages.push(MessagePayload::plain(ChatRole::User, &request.input));

        for exchange in &request.exchanges {
            messages.push(MessagePayload {
                role: ChatRole::Assistant.to_string(),
                content: None,
                tool_calls: Some(vec![ToolCallPayload {
                    id: exchange.call.id.clone(),
                    r#type: "function".into(),
                    function: FunctionCallPayload {
                        name: exchange.call.name.clone(),
                        arguments: exchange.call.arguments.to_string(),
                    },
                }]),
                tool_call_id: None,
            });
            messages.push(MessagePayload {
                role: ChatRole::Tool.to_string(),
                content: Some(exchange.result.output.clone()),
                tool_calls: None,
                tool_call_id: Some(exchange.result.tool_call_id.clone()),
            });
        }
        messages
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, ReasoningError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let tool_payloads: Option<Vec<ToolPayload>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ToolPayload {
                        r#type: "function",
                        function: FunctionPayload {
                            name: &t.name,
                            description: &t.description,
                            parameters: &t.parameters,
                        },
                    })
                    .collect(),
            )
        };

        let body = ChatRequest {
            model: &self.model,
            messages: Self::build_messages(request),
            tools: tool_payloads,
            max_tokens: self.max_tokens,
            temperature: 0.7,
        };

        debug!("Reasoning request to model: {}", self.model);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .context("Failed to parse reasoning response")?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(ReasoningOutput::default());
        };

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
            })
            .collect();

        Ok(ReasoningOutput {
            text: choice.message.content.filter(|c| !c.trim().is_empty()),
            tool_calls,
            notice: false,
        })
    }
}
