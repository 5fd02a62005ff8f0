//! Model clients with unified streaming support.
//!
//! # Architecture
//!
//! - [`ModelClient`] - the seam the conversation loop talks to
//! - [`openai`] - client for OpenAI-compatible `/chat/completions` servers
//!   (LM Studio, llama.cpp, Ollama and the hosted APIs)
//!
//! Streaming clients emit [`StreamEvent`]s through a
//! [`tokio::sync::mpsc::Sender`], allowing the caller to render content as it
//! arrives.
//!
//! # Error Handling
//!
//! Failures that happen before any output (connection refused, non-2xx
//! status) are returned as [`ModelError`]. Failures once the stream is
//! flowing are delivered as `StreamEvent::Error` so partial output survives.

pub mod openai;
pub mod retry;
mod sse;
pub mod sse_types;

use std::env;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use mcode_types::{Message, StreamEvent, TokenUsage, ToolCall, ToolDefinition};
use reqwest::{Client, redirect};
use tokio::sync::mpsc;
use tracing::error;

pub use mcode_types;
pub use openai::OpenAiClient;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Shared HTTP client.
///
/// Plain `http://` is allowed: the default models are served from localhost.
pub fn http_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(redirect::Policy::none())
            .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build tuned HTTP client: {e}. Falling back to defaults.");
                Client::new()
            })
    })
}

/// How long a stream may stay silent before it is abandoned.
///
/// Local models can take a while to produce the first token of a long prompt,
/// so this is generous. Override with `MCODE_STREAM_IDLE_TIMEOUT_SECS`.
pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = env::var("MCODE_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        source: reqwest::Error,
    },
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("stream error: {0}")]
    Stream(String),
}

/// One request to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Empty when tools are disabled for this request.
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub stream: bool,
}

/// A complete (non-streamed) model response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// `None` when the server did not report usage.
    pub usage: Option<TokenUsage>,
}

/// Model future type alias.
pub type ModelFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ModelError>> + Send + 'a>>;

/// A chat model backend.
pub trait ModelClient: Send + Sync {
    /// Send `request` and wait for the whole response.
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> ModelFut<'a, ChatResponse>;

    /// Send `request` and forward the response as it streams in.
    ///
    /// Ends with `StreamEvent::Done` or `StreamEvent::Error` unless it
    /// returns `Err` first.
    fn stream<'a>(
        &'a self,
        request: &'a ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ModelFut<'a, ()>;
}
