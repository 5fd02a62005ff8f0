//! Built-in tool executors.

use std::fs as std_fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use mcode_utils::{atomic_write, render_diff, render_focused_diff};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Instant};
use tokio::{fs, task};
use tracing::{debug, info, warn};

use crate::process::{ChildGuard, set_detached_session, set_new_session};
use crate::replace;
use crate::shell::DetectedShell;
use crate::{ToolCtx, ToolError, ToolExecutor, ToolFut, ToolKind, parse_args};

pub const DEFAULT_MAX_SEARCH_MATCHES: usize = 500;

/// Cap on captured command output; later bytes are drained and discarded.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    include: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditFileArgs {
    file_path: String,
    #[serde(default)]
    old_string: Option<String>,
    #[serde(default)]
    new_string: Option<String>,
    #[serde(default)]
    replace_all: bool,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewArgs {
    path: String,
    content: String,
}

fn non_empty(value: &str, field: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::BadArgs {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

/// Current file content, or `None` when the file does not exist yet.
async fn read_existing(kind: ToolKind, path: &Path) -> Result<Option<String>, ToolError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ToolError::failed(kind, format!("error reading file: {e}"))),
    }
}

async fn write_file(kind: ToolKind, path: PathBuf, content: String) -> Result<(), ToolError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::failed(kind, format!("error creating directory: {e}")))?;
    }
    task::spawn_blocking(move || atomic_write(&path, content.as_bytes()))
        .await
        .map_err(|e| ToolError::failed(kind, format!("write task failed: {e}")))?
        .map_err(|e| ToolError::failed(kind, format!("error writing file: {e}")))
}

// ============================================================================
// read_file
// ============================================================================

#[derive(Debug, Default)]
pub struct ReadFileTool;

impl ToolExecutor for ReadFileTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file to read" }
            },
            "required": ["path"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: PathArgs = parse_args(&args)?;
            non_empty(&typed.path, "path")?;
            let path = ctx.resolve(&typed.path);
            fs::read_to_string(&path)
                .await
                .map_err(|e| ToolError::failed(ToolKind::ReadFile, format!("error reading file: {e}")))
        })
    }
}

// ============================================================================
// list_files
// ============================================================================

#[derive(Debug, Default)]
pub struct ListFilesTool;

impl ToolExecutor for ListFilesTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ListFiles
    }

    fn description(&self) -> &'static str {
        "List files in a directory"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path to list (default: current directory)" }
            }
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ListFilesArgs = parse_args(&args)?;
            let dir = ctx.resolve(typed.path.as_deref().unwrap_or("."));
            let fail =
                |e: io::Error| ToolError::failed(ToolKind::ListFiles, format!("error listing directory: {e}"));

            let mut entries = Vec::new();
            let mut reader = fs::read_dir(&dir).await.map_err(fail)?;
            while let Some(entry) = reader.next_entry().await.map_err(fail)? {
                let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let listing: Vec<String> = entries
                .into_iter()
                .map(|(name, is_dir)| if is_dir { format!("{name}/") } else { name })
                .collect();
            Ok(listing.join("\n"))
        })
    }
}

// ============================================================================
// bash_command
// ============================================================================

#[derive(Debug, Clone)]
pub struct BashCommandTool {
    shell: DetectedShell,
    timeout: Duration,
}

impl BashCommandTool {
    #[must_use]
    pub fn new(shell: DetectedShell, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

impl ToolExecutor for BashCommandTool {
    fn kind(&self) -> ToolKind {
        ToolKind::BashCommand
    }

    fn description(&self) -> &'static str {
        "Execute a bash command"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command to execute" }
            },
            "required": ["command"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: CommandArgs = parse_args(&args)?;
            non_empty(&typed.command, "command")?;
            run_shell(&self.shell, &typed.command, &ctx.working_dir, self.timeout).await
        })
    }
}

/// Shared sink both output pipes append to, so stdout and stderr interleave
/// in arrival order.
type OutputSink = Arc<Mutex<Vec<u8>>>;

async fn collect_output<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut out) = sink.lock() {
                    let room = MAX_OUTPUT_BYTES.saturating_sub(out.len());
                    out.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
    }
}

fn snapshot(sink: &OutputSink) -> String {
    sink.lock()
        .map(|out| String::from_utf8_lossy(&out).into_owned())
        .unwrap_or_default()
}

/// Run `command` through `shell`, killing its whole process group once
/// `timeout` elapses.
async fn run_shell(
    shell: &DetectedShell,
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<String, ToolError> {
    let mut cmd = shell.command(command);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    set_new_session(&mut cmd);

    let child = cmd
        .spawn()
        .map_err(|e| ToolError::failed(ToolKind::BashCommand, format!("failed to spawn {shell}: {e}")))?;
    let mut guard = ChildGuard::new(child);
    let pid = guard.id();
    debug!(?pid, %shell, command, "spawned command");

    let sink: OutputSink = Arc::new(Mutex::new(Vec::new()));
    let stdout = guard.child_mut().stdout.take();
    let stderr = guard.child_mut().stderr.take();
    let stdout_task = stdout.map(|out| tokio::spawn(collect_output(out, Arc::clone(&sink))));
    let stderr_task = stderr.map(|err| tokio::spawn(collect_output(err, Arc::clone(&sink))));

    // The deadline covers draining too: a stray grandchild holding the pipes
    // open must not outlive the timeout.
    let deadline = Instant::now() + timeout;
    let finished = time::timeout_at(deadline, async {
        let status = guard.child_mut().wait().await;
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }
        status
    })
    .await;

    match finished {
        Ok(Ok(status)) => {
            guard.disarm();
            let output = snapshot(&sink);
            if status.success() {
                Ok(output)
            } else {
                Err(ToolError::CommandFailed {
                    exit_code: status.code().unwrap_or(-1),
                    output,
                })
            }
        }
        Ok(Err(e)) => Err(ToolError::failed(
            ToolKind::BashCommand,
            format!("failed waiting for command: {e}"),
        )),
        Err(_) => {
            drop(guard);
            warn!(?pid, secs = timeout.as_secs(), "command timed out; process group killed");
            Err(ToolError::Timeout {
                elapsed: timeout,
                output: snapshot(&sink),
            })
        }
    }
}

// ============================================================================
// background bash
// ============================================================================

#[derive(Debug, Clone)]
pub struct BashBackgroundTool {
    shell: DetectedShell,
}

impl BashBackgroundTool {
    #[must_use]
    pub fn new(shell: DetectedShell) -> Self {
        Self { shell }
    }
}

impl ToolExecutor for BashBackgroundTool {
    fn kind(&self) -> ToolKind {
        ToolKind::BashBackground
    }

    fn description(&self) -> &'static str {
        "Start a bash command in the background without waiting for it"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command to start" }
            },
            "required": ["command"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: CommandArgs = parse_args(&args)?;
            non_empty(&typed.command, "command")?;

            let mut cmd = self.shell.command(&typed.command);
            cmd.current_dir(&ctx.working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            set_detached_session(&mut cmd);

            let child = cmd.spawn().map_err(|e| {
                ToolError::failed(
                    ToolKind::BashBackground,
                    format!("failed to start command in background: {e}"),
                )
            })?;
            let pid = child.id().unwrap_or_default();
            info!(pid, command = %typed.command, "started background command");

            Ok(format!(
                "Command started in background with PID {pid}. Use 'ps aux | grep \"{}\"' to check status.",
                typed.command
            ))
        })
    }
}

// ============================================================================
// search_code
// ============================================================================

#[derive(Debug, Clone)]
pub struct SearchCodeTool {
    max_matches: usize,
}

impl SearchCodeTool {
    #[must_use]
    pub fn new(max_matches: usize) -> Self {
        Self { max_matches }
    }
}

impl Default for SearchCodeTool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEARCH_MATCHES)
    }
}

impl ToolExecutor for SearchCodeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::SearchCode
    }

    fn description(&self) -> &'static str {
        "Search for code patterns in files"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Pattern to search for (regex; invalid regexes are searched literally)" },
                "directory": { "type": "string", "description": "Directory to search in (default: current directory)" },
                "include": { "type": "string", "description": "Optional glob limiting which files are searched, e.g. \"*.rs\"" }
            },
            "required": ["pattern"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: SearchArgs = parse_args(&args)?;
            if typed.pattern.is_empty() {
                return Err(ToolError::BadArgs {
                    message: "pattern must not be empty".to_string(),
                });
            }

            let matcher = Regex::new(&typed.pattern).or_else(|_| {
                debug!(pattern = %typed.pattern, "invalid regex; searching literally");
                Regex::new(&regex::escape(&typed.pattern))
            });
            let matcher = matcher.map_err(|e| ToolError::BadArgs {
                message: format!("invalid pattern: {e}"),
            })?;

            let include = typed
                .include
                .as_deref()
                .map(|glob| {
                    GlobBuilder::new(glob)
                        .literal_separator(false)
                        .build()
                        .map(|g| g.compile_matcher())
                })
                .transpose()
                .map_err(|e| ToolError::BadArgs {
                    message: format!("invalid include glob: {e}"),
                })?;

            let display_root = PathBuf::from(typed.directory.as_deref().unwrap_or("."));
            let root = ctx.resolve(&display_root);
            let max_matches = self.max_matches;

            task::spawn_blocking(move || {
                search_tree(&root, &display_root, &matcher, include.as_ref(), max_matches)
            })
            .await
            .map_err(|e| ToolError::failed(ToolKind::SearchCode, format!("search task failed: {e}")))?
        })
    }
}

fn search_tree(
    root: &Path,
    display_root: &Path,
    matcher: &Regex,
    include: Option<&GlobMatcher>,
    max_matches: usize,
) -> Result<String, ToolError> {
    if !root.exists() {
        return Err(ToolError::failed(
            ToolKind::SearchCode,
            format!("directory not found: {}", display_root.display()),
        ));
    }

    let mut hits = Vec::new();
    let mut truncated = false;
    let walker = WalkBuilder::new(root)
        .sort_by_file_path(Path::cmp)
        .build();

    'files: for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if let Some(glob) = include
            && !glob.is_match(relative)
        {
            continue;
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(text) = std_fs::read_to_string(entry.path()) else {
            continue;
        };
        let shown = if relative.as_os_str().is_empty() {
            display_root.to_path_buf()
        } else {
            display_root.join(relative)
        };
        for (idx, line) in text.lines().enumerate() {
            if matcher.is_match(line) {
                if hits.len() == max_matches {
                    truncated = true;
                    break 'files;
                }
                hits.push(format!("{}:{}:{line}", shown.display(), idx + 1));
            }
        }
    }

    let mut out = hits.join("\n");
    if truncated {
        out.push_str(&format!("\n... (stopped after {max_matches} matches)"));
    }
    Ok(out)
}

// ============================================================================
// edit_file
// ============================================================================

#[derive(Debug, Default)]
pub struct EditFileTool;

impl ToolExecutor for EditFileTool {
    fn kind(&self) -> ToolKind {
        ToolKind::EditFile
    }

    fn description(&self) -> &'static str {
        "Perform incremental edits to a file using find-and-replace. MUCH FASTER than full file rewrites. \
         For new files, use newString only. For edits, use oldString+newString."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "The absolute path to the file to modify" },
                "oldString": { "type": "string", "description": "The text to replace (for editing existing files). Supports fuzzy matching for whitespace differences." },
                "newString": { "type": "string", "description": "The replacement text. For new files, provide this without oldString. For edits, use with oldString." },
                "replaceAll": { "type": "boolean", "description": "Replace all occurrences of oldString (default: false - only replace if unique match)" },
                "content": { "type": "string", "description": "Complete new file content (full rewrite; prefer oldString/newString for edits)" }
            },
            "required": ["filePath"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: EditFileArgs = parse_args(&args)?;
            non_empty(&typed.file_path, "filePath")?;
            let path = ctx.resolve(&typed.file_path);
            let label = typed.file_path.as_str();

            match (typed.old_string.as_deref(), typed.new_string.as_deref()) {
                (Some(old), None) if !old.is_empty() => Err(ToolError::BadArgs {
                    message: "newString is required when oldString is provided".to_string(),
                }),
                (old, Some(new)) => {
                    replace_edit(&path, label, old.unwrap_or_default(), new, typed.replace_all)
                        .await
                }
                (_, None) => match typed.content {
                    Some(content) => full_rewrite(&path, label, content).await,
                    None => Err(ToolError::BadArgs {
                        message: "either oldString+newString, newString, or content must be provided"
                            .to_string(),
                    }),
                },
            }
        })
    }
}

/// `oldString`/`newString` edits. An empty `old` writes `new` as the whole file.
async fn replace_edit(
    path: &Path,
    label: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<String, ToolError> {
    if old.is_empty() {
        let existing = read_existing(ToolKind::EditFile, path).await?;
        let current = existing.as_deref().unwrap_or_default();
        let updated = replace::replace(current, old, new, replace_all)?;
        write_file(ToolKind::EditFile, path.to_path_buf(), updated).await?;
        return Ok(match existing {
            None => format!("File {label} has been created"),
            Some(_) => format!("File {label} has been modified"),
        });
    }

    let original = fs::read_to_string(path)
        .await
        .map_err(|e| ToolError::failed(ToolKind::EditFile, format!("error reading file: {e}")))?;
    let updated = replace::replace(&original, old, new, replace_all)?;
    write_file(ToolKind::EditFile, path.to_path_buf(), updated.clone()).await?;
    Ok(render_focused_diff(&original, &updated, label, old, new))
}

async fn full_rewrite(path: &Path, label: &str, content: String) -> Result<String, ToolError> {
    let existing = read_existing(ToolKind::EditFile, path).await?;
    let message = match existing.as_deref() {
        None => format!("File {label} has been created"),
        Some(old) if old == content => return Ok(format!("File {label} unchanged")),
        Some(_) => format!("File {label} has been modified"),
    };
    write_file(ToolKind::EditFile, path.to_path_buf(), content).await?;
    Ok(message)
}

// ============================================================================
// preview_edit
// ============================================================================

#[derive(Debug, Default)]
pub struct PreviewEditTool;

impl ToolExecutor for PreviewEditTool {
    fn kind(&self) -> ToolKind {
        ToolKind::PreviewEdit
    }

    fn description(&self) -> &'static str {
        "Preview the diff a full-content edit would produce without writing the file"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file to preview" },
                "content": { "type": "string", "description": "Proposed complete file content" }
            },
            "required": ["path", "content"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: PreviewArgs = parse_args(&args)?;
            non_empty(&typed.path, "path")?;
            let path = ctx.resolve(&typed.path);
            let existing = read_existing(ToolKind::PreviewEdit, &path).await?;
            let old = existing.as_deref().unwrap_or_default();

            if old == typed.content {
                return Ok(format!("Preview: No changes would be made to {}", typed.path));
            }
            let headline = if existing.is_none() {
                format!("Preview: Would create new file {}", typed.path)
            } else {
                format!("Preview: Would modify file {}", typed.path)
            };
            let diff = render_diff(old, &typed.content, &typed.path);
            Ok(format!("{headline}\n\n{diff}"))
        })
    }
}
