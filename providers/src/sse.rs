//! Server-sent event framing shared by streaming clients.

use std::str;
use std::time::Duration;

use futures_util::StreamExt;
use mcode_types::StreamEvent;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::warn;

use crate::ModelError;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

pub(crate) const DONE_MARKER: &str = "[DONE]";

pub(crate) fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

pub(crate) fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

/// Join the `data:` lines of one event. `None` when the event carries no data.
pub(crate) fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events and continue
    Emit(Vec<StreamEvent>),
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &Value) -> SseParseAction;

    /// Whether the server already signalled completion, so EOF without the
    /// `[DONE]` marker is still a clean end.
    fn finished(&self) -> bool {
        false
    }
}

async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Drive an SSE response body through `parser`, forwarding events to `tx`.
///
/// Stream-level failures (idle timeout, oversized buffer, malformed payloads,
/// premature EOF) are delivered as `StreamEvent::Error` so partial output is
/// kept. Transport errors reading the body return `Err`.
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<(), ModelError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == DONE_MARKER {
                let _ = send_event(tx, StreamEvent::Done).await;
                return Ok(());
            }

            match serde_json::from_str::<Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, StreamEvent::Error(msg)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    warn!(%e, payload_bytes = data.len(), "Invalid SSE JSON payload");
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    let terminal = if parser.finished() {
        StreamEvent::Done
    } else {
        StreamEvent::Error("Connection closed before stream completed".to_string())
    };
    let _ = send_event(tx, terminal).await;
    Ok(())
}
