//! The human in the loop.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use mcode_types::ToolCall;

/// What the operator chose for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Execute,
    Skip,
    Deny,
    /// Start detached; only honored for long-running commands.
    Background,
    /// Abandon the rest of the batch. An empty instruction only records the
    /// interruption and the batch continues.
    Interrupt(String),
}

pub type OperatorFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Confirmation prompts. Both may wait on the operator indefinitely.
pub trait Operator: Send + Sync {
    /// Decide on `call`. `long_running` tells whether background is on offer.
    fn confirm_tool<'a>(&'a self, call: &'a ToolCall, long_running: bool)
    -> OperatorFut<'a, Decision>;

    /// Approve read access to `folder` and everything beneath it.
    fn approve_folder<'a>(&'a self, folder: &'a Path) -> OperatorFut<'a, bool>;
}
