//! Terminal rendering of turn progress.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use crossterm::execute;
use crossterm::style::{Color, Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use mcode_engine::{Progress, ProgressSink, TokenUsage};

/// Error fragments that point at an overflowing context window.
const OVERFLOW_HINTS: [&str; 3] = ["context", "too long", "maximum"];

/// Prints progress to stdout as it happens.
pub struct TerminalSink {
    /// Config key of the active model, for retry hints.
    model: Mutex<String>,
}

impl TerminalSink {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: Mutex::new(model.into()),
        }
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.lock().unwrap_or_else(PoisonError::into_inner) = model.into();
    }

    fn model(&self) -> String {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressSink for TerminalSink {
    fn emit(&self, event: Progress) {
        let mut out = io::stdout().lock();
        match event {
            Progress::TextDelta(text) => {
                let _ = write!(out, "{text}");
            }
            Progress::ToolHeader { name, detail } => {
                let header = tool_header(&name, detail.as_deref());
                let _ = writeln!(out, "\n{}", header.cyan());
            }
            Progress::LongRunning => {
                let _ = writeln!(out, "{}", "⚠️  This looks like a long-running command!".yellow());
            }
            Progress::ToolOutput {
                name,
                output,
                success,
            } => {
                if !success {
                    let _ = writeln!(out, "{}", format!("❌ {output}").red());
                } else if name == "bash_background" {
                    let _ = writeln!(out, "{}", "✅ Command started in background".green());
                } else {
                    if shows_diff(&name) {
                        for line in output.lines() {
                            match diff_line_color(line) {
                                Some(color) => {
                                    let _ = writeln!(out, "{}", line.with(color));
                                }
                                None => {
                                    let _ = writeln!(out, "{line}");
                                }
                            }
                        }
                    }
                    let _ = writeln!(out, "{}", "✅ Tool executed successfully".green());
                }
            }
            Progress::ToolNotRun { message } => {
                if let Some(line) = not_run_line(&message) {
                    let _ = writeln!(out, "{line}");
                }
            }
            Progress::FolderApproved(folder) => {
                let line = format!(
                    "✅ Folder access granted: {} (includes all subfolders)",
                    folder.display()
                );
                let _ = writeln!(out, "{}", line.green());
            }
            Progress::FolderDenied(_) => {
                let _ = writeln!(out, "{}", "❌ Folder access denied".red());
            }
            Progress::Trimmed {
                prompt_tokens,
                before,
                after,
            } => {
                let _ = writeln!(
                    out,
                    "{}",
                    format!(
                        "⚠️  Context getting large ({prompt_tokens} tokens), trimming older messages..."
                    )
                    .yellow()
                );
                let _ = writeln!(out, "📉 Context trimmed: {before} → {after} messages");
            }
            Progress::Retrying { error } => {
                let _ = writeln!(out, "{}", format!("\n⚠️  Request failed: {error}").yellow());
                for line in retry_hint(&error, &self.model()) {
                    let _ = writeln!(out, "{line}");
                }
                let _ = writeln!(out, "🔄 Retrying with simplified request...");
            }
            Progress::SpinnerFrame(frame) => {
                let _ = write!(out, "\r{frame} ");
            }
            Progress::SpinnerClear => {
                let _ = execute!(out, Print("\r"), Clear(ClearType::CurrentLine));
            }
            Progress::Usage {
                last,
                session_total,
            } => {
                let _ = writeln!(out, "\n{}", usage_line(last, session_total).blue());
            }
        }
        let _ = out.flush();
    }
}

/// `🔧 name` plus the call's key argument, formatted per tool.
pub fn tool_header(name: &str, detail: Option<&str>) -> String {
    match (name, detail) {
        ("bash_command", Some(command)) => format!("🔧 {name} `{command}`"),
        ("search_code", Some(pattern)) => format!("🔧 {name} \"{pattern}\""),
        (_, Some(path)) => format!("🔧 {name} {path}"),
        (_, None) => format!("🔧 {name}"),
    }
}

fn shows_diff(tool: &str) -> bool {
    matches!(tool, "edit_file" | "preview_edit")
}

/// Red for removed lines, green for added ones.
pub fn diff_line_color(line: &str) -> Option<Color> {
    if line.starts_with('-') && !line.starts_with("---") {
        Some(Color::Red)
    } else if line.starts_with('+') && !line.starts_with("+++") {
        Some(Color::Green)
    } else {
        None
    }
}

/// `None` when the reason was already shown, as for folder denials.
fn not_run_line(message: &str) -> Option<String> {
    let line = match message {
        "Permission denied for folder access" => return None,
        "Tool execution skipped by user" => "⏭️  Tool execution skipped".to_string(),
        "Tool execution denied by user" => "❌ Tool execution denied".red().to_string(),
        m if m.starts_with("Error:") => format!("❌ {m}").red().to_string(),
        m if m.starts_with("Tool execution interrupted") => {
            "⚠️  No alternative instruction provided".yellow().to_string()
        }
        m => format!("⚠️  {m}").yellow().to_string(),
    };
    Some(line)
}

pub fn usage_line(last: TokenUsage, session_total: u64) -> String {
    format!(
        "[Context: {} tokens | Response: {} tokens | Session: {session_total} tokens]",
        last.prompt_tokens, last.completion_tokens
    )
}

/// What to tell the user about a failed request before it is retried.
pub fn retry_hint(error: &str, model: &str) -> Vec<String> {
    if OVERFLOW_HINTS.iter().any(|hint| error.contains(hint)) {
        vec!["💡 This looks like a context window overflow. Trimming context and retrying...".to_string()]
    } else {
        vec![
            format!("💡 This may be a tool calling format issue with model '{model}'."),
            "   Try switching to a more compatible model with: /models".to_string(),
        ]
    }
}

/// REPL prompt showing the size of the last request.
pub fn context_prompt(tokens: u32) -> String {
    match tokens {
        0 => "> ".to_string(),
        t if t >= 1000 => format!("[{}k tokens] > ", t / 1000),
        t => format!("[{t} tokens] > "),
    }
}
