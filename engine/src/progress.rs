//! Human-readable side channel for a running turn.

use std::path::PathBuf;

use mcode_types::TokenUsage;

/// Something the operator should see while a turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Streamed assistant text.
    TextDelta(String),
    /// A tool call is about to be confirmed or run. `detail` holds the key
    /// parameter: path, command or pattern.
    ToolHeader {
        name: String,
        detail: Option<String>,
    },
    /// The call looks long-running, so background is offered.
    LongRunning,
    /// Output of a call that ran. Edit results carry rendered diffs.
    ToolOutput {
        name: String,
        output: String,
        success: bool,
    },
    /// A call was not run; `message` is the result recorded for it.
    ToolNotRun { message: String },
    FolderApproved(PathBuf),
    FolderDenied(PathBuf),
    /// History was cut down before a request.
    Trimmed {
        prompt_tokens: u32,
        before: usize,
        after: usize,
    },
    /// A request failed and is being retried in simplified form.
    Retrying { error: String },
    SpinnerFrame(char),
    SpinnerClear,
    /// End-of-turn accounting.
    Usage {
        last: TokenUsage,
        session_total: u64,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: Progress);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: Progress) {}
}
