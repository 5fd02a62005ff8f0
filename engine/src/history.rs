//! Context-size control: trimming and response budgeting.

use mcode_types::{Message, estimate_tokens};

use crate::config::ContextConfig;

/// Histories this short are never trimmed.
pub const MIN_TRIMMABLE_MESSAGES: usize = 3;

/// Tokens held back from the window when sizing a response.
const SAFETY_MARGIN_TOKENS: u32 = 1_000;

/// System messages plus the most recent `keep_recent` non-system messages.
///
/// A cut that lands inside a tool batch moves back to the assistant message
/// that made the calls, so results are never separated from their call. The
/// latest user message is kept even when it falls before the cut.
#[must_use]
pub fn trim_history(messages: &[Message], keep_recent: usize) -> Vec<Message> {
    if messages.len() <= MIN_TRIMMABLE_MESSAGES {
        return messages.to_vec();
    }

    let non_system: Vec<&Message> = messages.iter().filter(|m| !m.is_system()).collect();
    let cut = batch_start(&non_system, non_system.len().saturating_sub(keep_recent));
    let latest_user = non_system[..cut]
        .iter()
        .rposition(|m| matches!(m, Message::User { .. }))
        .filter(|&i| !non_system[cut..].iter().any(|m| matches!(m, Message::User { .. })))
        .map(|i| non_system[i]);

    messages
        .iter()
        .filter(|m| m.is_system())
        .chain(latest_user)
        .chain(non_system[cut..].iter().copied())
        .cloned()
        .collect()
}

/// Move `cut` back over tool results to the assistant message owning them.
///
/// Results with no owning assistant before them are skipped instead.
fn batch_start(messages: &[&Message], cut: usize) -> usize {
    let owner = messages[..cut]
        .iter()
        .rposition(|m| !matches!(m, Message::Tool { .. }));
    let leads_with_results = messages
        .get(cut)
        .is_some_and(|m| matches!(m, Message::Tool { .. }));
    if !leads_with_results {
        return cut;
    }
    match owner {
        Some(i) if matches!(messages[i], Message::Assistant { .. }) => i,
        _ => {
            cut + messages[cut..]
                .iter()
                .take_while(|m| matches!(m, Message::Tool { .. }))
                .count()
        }
    }
}

/// Whether a request at `prompt_tokens` should go out trimmed.
#[must_use]
pub fn needs_trim(prompt_tokens: Option<u32>, config: &ContextConfig) -> bool {
    prompt_tokens.is_some_and(|tokens| tokens > config.high_water_tokens)
}

/// `max_tokens` for the next request.
///
/// The configured maximum, shrunk to what is left of the window after the
/// last prompt, but never below the configured minimum.
#[must_use]
pub fn response_budget(prompt_tokens: Option<u32>, config: &ContextConfig) -> u32 {
    let Some(prompt) = prompt_tokens else {
        return config.max_response_tokens;
    };
    let remaining = i64::from(config.window_tokens)
        - i64::from(prompt)
        - i64::from(SAFETY_MARGIN_TOKENS);
    if remaining < i64::from(config.max_response_tokens) {
        let floor = i64::from(config.min_response_tokens);
        u32::try_from(remaining.max(floor)).unwrap_or(config.min_response_tokens)
    } else {
        config.max_response_tokens
    }
}

/// Prompt size estimate when the server reports no usage.
#[must_use]
pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_tokens(m.content()))
        .fold(0u32, u32::saturating_add)
}

/// Completion size estimate when the server reports no usage. At least 1.
#[must_use]
pub fn estimate_completion_tokens(content: &str) -> u32 {
    estimate_tokens(content).max(1)
}
