//! Core domain types for mcode.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod message;
pub use message::{Message, Role};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Tool Calling Types
// ============================================================================

/// Definition of a tool that can be called by the LLM.
///
/// This follows the function calling schema used by OpenAI-compatible servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (function name).
    pub name: String,
    /// A description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool call requested by the LLM.
///
/// Arguments are kept as the raw JSON text the model produced. They are only
/// parsed at dispatch time so a malformed payload becomes a tool error instead
/// of a dropped call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call (used to match results).
    pub id: String,
    /// The name of the tool being called.
    pub name: String,
    /// Raw JSON arguments.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the raw arguments. An empty payload is treated as `{}`.
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool-call fragments.
///
/// Fragments are keyed by the stream index. Ids and names overwrite when
/// present; argument text is concatenated in arrival order.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
    ) {
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            entry.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            entry.name = name.to_string();
        }
        entry.arguments.push_str(arguments);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize into tool calls ordered by stream index.
    ///
    /// Some local servers omit call ids; those get a stable `call_{index}` id so
    /// results can still be correlated.
    #[must_use]
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, partial)| {
                let id = if partial.id.is_empty() {
                    format!("call_{index}")
                } else {
                    partial.id
                };
                ToolCall {
                    id,
                    name: partial.name,
                    arguments: partial.arguments,
                }
            })
            .collect()
    }
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Events emitted by a model client while a response streams in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text content delta.
    TextDelta(String),
    /// Fragment of a tool call, keyed by its position in the response.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Token usage reported by the server (usually in the final chunk).
    Usage(TokenUsage),
    /// Stream completed.
    Done,
    /// Error occurred.
    Error(String),
}

// ============================================================================
// Token Usage
// ============================================================================

/// Characters per token used when the server does not report usage.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Rough token estimate for `text` (about four characters per token).
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.len() / CHARS_PER_TOKEN).unwrap_or(u32::MAX)
}
