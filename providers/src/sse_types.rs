//! Typed wire structures for the chat completions API.
//!
//! Every field the client reads is optional or defaulted: local inference
//! servers omit fields the hosted APIs always send.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept tool arguments either as JSON text or as an inline JSON object.
fn arguments_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    })
}

/// One `chat.completion.chunk` payload from a streamed response.
#[derive(Debug, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: Vec<ToolCallChunk>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub function: FunctionChunk,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionChunk {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

/// Non-streaming `chat.completion` response.
#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletion {
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: CompletionMessage,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireToolCall {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub function: WireFunction,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "arguments_text")]
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tolerates_missing_fields() {
        let chunk: ChatChunk = serde_json::from_str(r#"{"choices":[{"delta":{}}]}"#).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert!(chunk.choices[0].delta.content.is_none());
        assert!(chunk.choices[0].delta.tool_calls.is_empty());
        assert!(chunk.usage.is_none());
    }

    #[test]
    fn explicit_nulls_read_as_empty() {
        let chunk: ChatChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":null,"tool_calls":null}}]}"#)
                .unwrap();
        assert!(chunk.choices[0].delta.tool_calls.is_empty());
    }

    #[test]
    fn chunk_reads_tool_call_fragments() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_9","type":"function","function":{"name":"read_file","arguments":"{\"pa"}}]}}]}"#,
        )
        .unwrap();
        let call = &chunk.choices[0].delta.tool_calls[0];
        assert_eq!(call.index, 1);
        assert_eq!(call.id.as_deref(), Some("call_9"));
        assert_eq!(call.function.name.as_deref(), Some("read_file"));
        assert_eq!(call.function.arguments.as_deref(), Some("{\"pa"));
    }

    #[test]
    fn inline_object_arguments_become_text() {
        let completion: ChatCompletion = serde_json::from_str(
            r#"{"choices":[{"message":{"tool_calls":[{"id":"c1","function":{"name":"list_files","arguments":{"path":"."}}}]}}]}"#,
        )
        .unwrap();
        let call = &completion.choices[0].message.tool_calls[0];
        assert_eq!(call.function.arguments, r#"{"path":"."}"#);
    }

    #[test]
    fn completion_reads_message_and_usage() {
        let completion: ChatCompletion = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        )
        .unwrap();
        assert_eq!(completion.choices[0].message.content.as_deref(), Some("hi"));
        let usage = completion.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (12, 3));
    }
}
