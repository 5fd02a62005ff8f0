//! Line input shared by the REPL and the confirmation prompts.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crossterm::style::Stylize;
use mcode_engine::{Decision, Operator, OperatorFut, ToolCall};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin, stdin};
use tokio::sync::Mutex;
use tracing::warn;

pub struct Console {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(stdin()).lines()),
        }
    }

    /// Print `prompt` and read one line. `None` at end of input.
    pub async fn read_line(&self, prompt: &str) -> Option<String> {
        let mut out = io::stdout();
        let _ = write!(out, "{prompt}");
        let _ = out.flush();

        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                None
            }
        }
    }
}

/// Answer typed at the tool prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAnswer {
    Execute,
    Skip,
    Deny,
    Background,
    Interrupt,
}

impl ToolAnswer {
    /// Enter or `y` executes; anything unrecognized denies.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => ToolAnswer::Execute,
            "s" | "skip" => ToolAnswer::Skip,
            "b" | "background" => ToolAnswer::Background,
            "i" | "interrupt" => ToolAnswer::Interrupt,
            _ => ToolAnswer::Deny,
        }
    }
}

/// Folder prompts default to yes.
pub fn folder_answer(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

pub fn tool_prompt(long_running: bool) -> &'static str {
    if long_running {
        "\n❓ Execute this tool? (Y/n/s to skip/i to interrupt/b for background): "
    } else {
        "\n❓ Execute this tool? (Y/n/s to skip/i to interrupt): "
    }
}

/// Asks the person at the terminal.
pub struct TerminalOperator {
    console: Arc<Console>,
}

impl TerminalOperator {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }
}

impl Operator for TerminalOperator {
    fn confirm_tool<'a>(
        &'a self,
        _call: &'a ToolCall,
        long_running: bool,
    ) -> OperatorFut<'a, Decision> {
        Box::pin(async move {
            // Bell, for a terminal in the background.
            print!("\x07");
            let Some(answer) = self.console.read_line(tool_prompt(long_running)).await else {
                return Decision::Deny;
            };

            match ToolAnswer::parse(&answer) {
                ToolAnswer::Execute => Decision::Execute,
                ToolAnswer::Skip => Decision::Skip,
                ToolAnswer::Deny => Decision::Deny,
                ToolAnswer::Background => {
                    if long_running {
                        println!("🚀 Starting command in background...");
                    }
                    Decision::Background
                }
                ToolAnswer::Interrupt => {
                    let instruction = self
                        .console
                        .read_line("\n💬 What would you like me to do instead? ")
                        .await
                        .unwrap_or_default();
                    let instruction = instruction.trim();
                    if !instruction.is_empty() {
                        println!("🔄 Interrupting with new instruction: {instruction}");
                    }
                    Decision::Interrupt(instruction.to_string())
                }
            }
        })
    }

    fn approve_folder<'a>(&'a self, folder: &'a Path) -> OperatorFut<'a, bool> {
        Box::pin(async move {
            println!("\n{}", format!("🔒 Request folder access: {}", folder.display()).yellow());
            self.console
                .read_line(
                    "❓ Allow list_files and read_file operations in this folder and all subfolders? (Y/n): ",
                )
                .await
                .is_some_and(|answer| folder_answer(&answer))
        })
    }
}
