//! Client for OpenAI-compatible chat completion servers.

use std::collections::HashSet;
use std::time::Duration;

use mcode_types::{Message, StreamEvent, TokenUsage, ToolCall, ToolDefinition};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::sse::{SseParseAction, SseParser, process_sse_stream};
use crate::sse_types::{ChatChunk, ChatCompletion, WireUsage};
use crate::{
    ChatRequest, ChatResponse, ModelClient, ModelError, ModelFut, http_client,
    read_capped_error_body, stream_idle_timeout,
};

// ========================================================================
// SSE Parser
// ========================================================================

#[derive(Default)]
struct ChatCompletionsParser {
    finished: bool,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

impl SseParser for ChatCompletionsParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: ChatChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Skipping unrecognised chunk: {e}");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            return SseParseAction::Error(error.message);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::TextDelta(text));
            }
            for call in choice.delta.tool_calls {
                events.push(StreamEvent::ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments.unwrap_or_default(),
                });
            }
            if choice.finish_reason.is_some() {
                self.finished = true;
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

// ========================================================================
// Request Building
// ========================================================================

/// Call ids that have both an assistant call and a tool result.
///
/// Servers reject either half on its own, which a trimmed history or an
/// interrupted batch can leave behind.
fn paired_call_ids(messages: &[Message]) -> HashSet<&str> {
    let results: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    messages
        .iter()
        .flat_map(Message::tool_calls)
        .map(|call| call.id.as_str())
        .filter(|id| results.contains(id))
        .collect()
}

fn build_messages(messages: &[Message]) -> Vec<Value> {
    let paired = paired_call_ids(messages);
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        match message {
            Message::System { content } => {
                out.push(json!({ "role": "system", "content": content }));
            }
            Message::User { content } => {
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::Assistant {
                content,
                tool_calls,
            } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .filter(|call| paired.contains(call.id.as_str()))
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments }
                        })
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "content": content });
                if !calls.is_empty() {
                    msg["tool_calls"] = Value::Array(calls);
                }
                out.push(msg);
            }
            Message::Tool {
                tool_call_id,
                content,
            } => {
                if paired.contains(tool_call_id.as_str()) {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "content": content
                    }));
                } else {
                    debug!(%tool_call_id, "dropping tool result without a matching call");
                }
            }
        }
    }

    out
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            })
        })
        .collect()
}

fn build_request_body(request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": build_messages(&request.messages),
        "max_tokens": request.max_tokens,
        "stream": request.stream,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(build_tools(&request.tools));
        body["tool_choice"] = json!("auto");
    }
    if request.stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn response_from_completion(completion: ChatCompletion) -> Result<ChatResponse, ModelError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Decode("response contained no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let id = if call.id.is_empty() {
                format!("call_{index}")
            } else {
                call.id
            };
            ToolCall::new(id, call.function.name, call.function.arguments)
        })
        .collect();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: completion.usage.map(Into::into),
    })
}

// ========================================================================
// Client
// ========================================================================

/// Client for a server exposing `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    retry: RetryConfig,
    idle_timeout: Duration,
}

impl OpenAiClient {
    /// `api_key` may be empty for local servers that do not authenticate.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: (!api_key.is_empty()).then_some(api_key),
            retry: RetryConfig::default(),
            idle_timeout: stream_idle_timeout(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let url = self.endpoint();
        let build = || {
            let request = http_client().post(&url).json(body);
            match &self.api_key {
                Some(key) => request.bearer_auth(key),
                None => request,
            }
        };

        match send_with_retry(build, &self.retry).await {
            RetryOutcome::Success(response) => Ok(response),
            RetryOutcome::HttpError(response) => {
                let status = response.status().as_u16();
                let body = read_capped_error_body(response).await;
                Err(ModelError::Api { status, body })
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                Err(ModelError::Connection { attempts, source })
            }
        }
    }
}

impl ModelClient for OpenAiClient {
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> ModelFut<'a, ChatResponse> {
        Box::pin(async move {
            let mut body = build_request_body(request);
            body["stream"] = json!(false);
            if let Some(map) = body.as_object_mut() {
                map.remove("stream_options");
            }

            let response = self.send(&body).await?;
            let completion: ChatCompletion = response
                .json()
                .await
                .map_err(|e| ModelError::Decode(e.to_string()))?;
            response_from_completion(completion)
        })
    }

    fn stream<'a>(
        &'a self,
        request: &'a ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ModelFut<'a, ()> {
        Box::pin(async move {
            let mut body = build_request_body(request);
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });

            let response = self.send(&body).await?;
            let mut parser = ChatCompletionsParser::default();
            process_sse_stream(response, &mut parser, &tx, self.idle_timeout).await
        })
    }
}
