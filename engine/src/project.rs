//! Project files in the working directory: AGENTS.md and context exports.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use mcode_types::{Message, TokenUsage};
use mcode_utils::atomic_write;
use tokio::{fs, task};
use tracing::{info, warn};

pub const AGENTS_FILE: &str = "AGENTS.md";
pub const DEFAULT_EXPORT_FILE: &str = "context.txt";

const PERMANENT_HEADER: &str = "### Permanent Instructions";
const PLACEHOLDER_PREFIX: &str = "*Use #command";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("No conversation context to export")]
    NothingToExport,
    #[error("instruction is empty")]
    EmptyInstruction,
}

/// Result of adding a permanent instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionAdded {
    /// AGENTS.md existed and was updated.
    Updated,
    /// AGENTS.md was missing and was created from the basic template first.
    CreatedFile,
}

/// Project files rooted at the session working directory.
#[derive(Debug, Clone)]
pub struct ProjectFiles {
    root: PathBuf,
}

impl ProjectFiles {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn agents_path(&self) -> PathBuf {
        self.root.join(AGENTS_FILE)
    }

    #[must_use]
    pub fn project_name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }

    /// AGENTS.md content, or `None` if the file is missing or unreadable.
    pub async fn load_agents_md(&self) -> Option<String> {
        let path = self.agents_path();
        match fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read AGENTS.md");
                None
            }
        }
    }

    /// Write the basic AGENTS.md template, replacing any existing file.
    pub async fn init(&self, now: DateTime<Local>) -> Result<PathBuf, ProjectError> {
        let path = self.agents_path();
        let content = basic_template(
            &self.project_name(),
            &self.root.display().to_string(),
            &now.format(TIMESTAMP_FORMAT).to_string(),
        );
        write_atomic(&path, content).await?;
        info!(path = %path.display(), "Initialized AGENTS.md");
        Ok(path)
    }

    /// Append `instruction` to the Permanent Instructions section.
    pub async fn add_permanent_instruction(
        &self,
        instruction: &str,
        now: DateTime<Local>,
    ) -> Result<InstructionAdded, ProjectError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ProjectError::EmptyInstruction);
        }

        let path = self.agents_path();
        let (content, added) = match fs::read_to_string(&path).await {
            Ok(content) => (content, InstructionAdded::Updated),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.init(now).await?;
                let content = fs::read_to_string(&path)
                    .await
                    .map_err(|source| ProjectError::Read {
                        path: path.clone(),
                        source,
                    })?;
                (content, InstructionAdded::CreatedFile)
            }
            Err(source) => return Err(ProjectError::Read { path, source }),
        };

        let updated = insert_permanent_instruction(&content, instruction);
        write_atomic(&path, updated).await?;
        info!(path = %path.display(), "Added permanent instruction");
        Ok(added)
    }

    /// Write a transcript of `conversation` and return the file written.
    pub async fn export(
        &self,
        file: Option<&str>,
        conversation: &[Message],
        last_usage: Option<TokenUsage>,
        session_total: u64,
        now: DateTime<Local>,
    ) -> Result<PathBuf, ProjectError> {
        if conversation.is_empty() {
            return Err(ProjectError::NothingToExport);
        }
        let path = self.root.join(export_file_name(file));
        let transcript = render_transcript(
            conversation,
            last_usage,
            session_total,
            &now.format(TIMESTAMP_FORMAT).to_string(),
        );
        fs::write(&path, transcript)
            .await
            .map_err(|source| ProjectError::Write {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), messages = conversation.len(), "Exported context");
        Ok(path)
    }
}

async fn write_atomic(path: &Path, content: String) -> Result<(), ProjectError> {
    let target = path.to_path_buf();
    let result = task::spawn_blocking(move || atomic_write(&target, content.as_bytes()))
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));
    result.map_err(|source| ProjectError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// `context.txt` by default; a `.txt` suffix is added when missing.
#[must_use]
pub fn export_file_name(file: Option<&str>) -> String {
    match file.map(str::trim).filter(|f| !f.is_empty()) {
        None => DEFAULT_EXPORT_FILE.to_string(),
        Some(name) if name.ends_with(".txt") => name.to_string(),
        Some(name) => format!("{name}.txt"),
    }
}

/// AGENTS.md skeleton written by `/init`.
///
/// Overview lines end in two spaces: markdown hard line breaks.
#[must_use]
pub fn basic_template(name: &str, location: &str, timestamp: &str) -> String {
    [
        format!("# {name} - AI Agent Instructions"),
        String::new(),
        "## Project Overview".to_string(),
        format!("**Project Name:** {name}  "),
        format!("**Location:** {location}  "),
        format!("**Initialized:** {timestamp}  "),
        String::new(),
        "## Project Structure".to_string(),
        "*Document your project structure and key files here*".to_string(),
        String::new(),
        "## Development Guidelines".to_string(),
        "*Add project-specific coding standards, patterns, and conventions here*".to_string(),
        String::new(),
        "## AI Agent Instructions".to_string(),
        String::new(),
        PERMANENT_HEADER.to_string(),
        format!("{PLACEHOLDER_PREFIX} to add permanent instructions for AI agents working on this project*"),
        String::new(),
        "### Project Context".to_string(),
        "*Key information about this project that AI agents should know*".to_string(),
        String::new(),
    ]
    .join("\n")
}

/// Add `- {instruction}` to the Permanent Instructions section of `content`.
///
/// - No section: one is inserted before the last `### ` heading, or appended
///   under a new `## AI Agent Instructions` heading.
/// - Section with bullets: the new bullet follows the last one.
/// - Section with only the `*Use #command…*` placeholder: the placeholder
///   becomes the first bullet.
/// - Otherwise the bullet goes right under the heading.
#[must_use]
pub fn insert_permanent_instruction(content: &str, instruction: &str) -> String {
    let bullet = format!("- {instruction}");

    let Some(header) = content.find(PERMANENT_HEADER) else {
        return match content.rfind("\n### ") {
            Some(at) => format!(
                "{}\n{PERMANENT_HEADER}\n{bullet}\n{}",
                &content[..at],
                &content[at..]
            ),
            None => format!(
                "{}\n\n## AI Agent Instructions\n\n{PERMANENT_HEADER}\n{bullet}\n",
                content.trim_end()
            ),
        };
    };

    let body_start = header + PERMANENT_HEADER.len();
    let body_end = content[body_start..]
        .find("\n### ")
        .map_or(content.len(), |at| body_start + at);

    let mut last_bullet_end = None;
    let mut placeholder = None;
    let mut offset = body_start;
    for line in content[body_start..body_end].split_inclusive('\n') {
        let text = line.trim_end_matches(['\n', '\r']);
        let trimmed = text.trim_start();
        let text_start = offset + (text.len() - trimmed.len());
        let text_end = offset + text.len();
        if trimmed.starts_with("- ") {
            last_bullet_end = Some(text_end);
        } else if placeholder.is_none() && trimmed.starts_with(PLACEHOLDER_PREFIX) {
            placeholder = Some((text_start, text_end));
        }
        offset += line.len();
    }

    match (last_bullet_end, placeholder) {
        (Some(at), _) => format!("{}\n{bullet}{}", &content[..at], &content[at..]),
        (None, Some((start, end))) => {
            format!("{}{bullet}{}", &content[..start], &content[end..])
        }
        (None, None) => format!(
            "{}\n{bullet}{}",
            &content[..body_start],
            &content[body_start..]
        ),
    }
}

/// Plain-text transcript of a conversation.
#[must_use]
pub fn render_transcript(
    conversation: &[Message],
    last_usage: Option<TokenUsage>,
    session_total: u64,
    exported_at: &str,
) -> String {
    let heavy_rule = "=".repeat(80);
    let light_rule = "-".repeat(40);

    let mut out = String::from("# MCode CLI Context Export\n");
    out.push_str(&format!("Exported: {exported_at}\n"));
    if let Some(usage) = last_usage {
        out.push_str(&format!("Context Tokens: {}\n", usage.prompt_tokens));
        out.push_str(&format!("Total Session Tokens: {session_total}\n"));
    }
    out.push_str(&format!("\n{heavy_rule}\n\n"));

    for (i, message) in conversation.iter().enumerate() {
        if i > 0 {
            out.push_str(&format!("\n{light_rule}\n\n"));
        }
        match message {
            Message::System { content } => {
                out.push_str(&format!("🔧 SYSTEM MESSAGE:\n{content}\n"));
            }
            Message::User { content } => {
                out.push_str(&format!("👤 USER:\n{content}\n"));
            }
            Message::Assistant {
                content,
                tool_calls,
            } => {
                out.push_str("🤖 ASSISTANT:\n");
                if !content.is_empty() {
                    out.push_str(&format!("{content}\n"));
                }
                for call in tool_calls {
                    out.push_str(&format!(
                        "\n🔧 TOOL CALL: {}\nArguments: {}\n",
                        call.name, call.arguments
                    ));
                }
            }
            Message::Tool { content, .. } => {
                out.push_str(&format!("⚙️ TOOL RESULT:\n{content}\n"));
            }
        }
    }

    out.push_str(&format!("\n{heavy_rule}\n"));
    out.push_str(&format!(
        "End of context export ({} messages)\n",
        conversation.len()
    ));
    out
}
