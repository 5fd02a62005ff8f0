//! Tool executor framework and the built-in coding tools.

pub mod builtins;
pub mod classify;
pub mod process;
pub mod replace;
pub mod shell;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use mcode_types::ToolDefinition;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use builtins::{
    BashBackgroundTool, BashCommandTool, EditFileTool, ListFilesTool, PreviewEditTool,
    ReadFileTool, SearchCodeTool,
};
pub use classify::is_long_running;
pub use replace::{MatchCandidate, MatchStrategy, ReplaceError};
pub use shell::{DetectedShell, ShellConfig, detect_shell};

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Default hard limit for `bash_command`.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Error types for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("command timed out after {secs}s\nOutput so far:\n{output}", secs = .elapsed.as_secs())]
    Timeout { elapsed: Duration, output: String },
    #[error("command failed with exit code {exit_code}\n{output}")]
    CommandFailed { exit_code: i32, output: String },
    #[error("{tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error(transparent)]
    Replace(#[from] ReplaceError),
}

impl ToolError {
    pub(crate) fn failed(tool: ToolKind, message: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            tool: tool.name().to_string(),
            message: message.into(),
        }
    }
}

/// Per-call execution context.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    /// Directory relative paths are resolved against.
    pub working_dir: PathBuf,
}

impl ToolCtx {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

/// Settings shared by the built-in tools.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub run_timeout: Duration,
    pub shell: DetectedShell,
    /// Stop collecting search hits after this many.
    pub max_search_matches: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_RUN_TIMEOUT,
            shell: detect_shell(None),
            max_search_matches: builtins::DEFAULT_MAX_SEARCH_MATCHES,
        }
    }
}

/// Contract every built-in tool implements.
pub trait ToolExecutor: Send + Sync {
    fn kind(&self) -> ToolKind;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// The closed set of tools mcode can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    ListFiles,
    BashCommand,
    /// Detached variant of `BashCommand`, only reachable through operator choice.
    BashBackground,
    SearchCode,
    EditFile,
    PreviewEdit,
}

/// Which folder a read-oriented tool needs approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderScope {
    /// The `path` argument itself is the folder.
    Path,
    /// The folder containing the `path` argument.
    ParentOfPath,
}

impl ToolKind {
    /// Tools advertised to the model, in schema order.
    pub const MODEL_FACING: [ToolKind; 6] = [
        ToolKind::ReadFile,
        ToolKind::ListFiles,
        ToolKind::BashCommand,
        ToolKind::EditFile,
        ToolKind::SearchCode,
        ToolKind::PreviewEdit,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::ListFiles => "list_files",
            ToolKind::BashCommand => "bash_command",
            ToolKind::BashBackground => "bash_background",
            ToolKind::SearchCode => "search_code",
            ToolKind::EditFile => "edit_file",
            ToolKind::PreviewEdit => "preview_edit",
        }
    }

    /// Resolve a model-facing tool name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::MODEL_FACING
            .into_iter()
            .find(|kind| kind.name() == name)
    }

    #[must_use]
    pub const fn folder_scope(self) -> Option<FolderScope> {
        match self {
            ToolKind::ListFiles => Some(FolderScope::Path),
            ToolKind::ReadFile | ToolKind::PreviewEdit => Some(FolderScope::ParentOfPath),
            ToolKind::BashCommand
            | ToolKind::BashBackground
            | ToolKind::SearchCode
            | ToolKind::EditFile => None,
        }
    }

    /// Folder the permission gate must check before this call runs.
    ///
    /// `None` for tools outside the gate, and for gated calls that carry no
    /// `path` argument; those fall back to an ordinary confirmation.
    #[must_use]
    pub fn approval_folder(self, args: &Value) -> Option<PathBuf> {
        let scope = self.folder_scope()?;
        let path = args.get("path")?.as_str()?;
        let folder = match scope {
            FolderScope::Path => PathBuf::from(path),
            FolderScope::ParentOfPath => match Path::new(path).parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };
        Some(folder)
    }

    /// Whether this call may be offered the background path.
    #[must_use]
    pub fn is_long_running_call(self, args: &Value) -> bool {
        self == ToolKind::BashCommand
            && args
                .get("command")
                .and_then(Value::as_str)
                .is_some_and(is_long_running)
    }
}

/// Dispatch table for the closed tool set.
pub struct ToolRegistry {
    read_file: ReadFileTool,
    list_files: ListFilesTool,
    bash_command: BashCommandTool,
    bash_background: BashBackgroundTool,
    search_code: SearchCodeTool,
    edit_file: EditFileTool,
    preview_edit: PreviewEditTool,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(settings: &ToolSettings) -> Self {
        Self {
            read_file: ReadFileTool,
            list_files: ListFilesTool,
            bash_command: BashCommandTool::new(settings.shell.clone(), settings.run_timeout),
            bash_background: BashBackgroundTool::new(settings.shell.clone()),
            search_code: SearchCodeTool::new(settings.max_search_matches),
            edit_file: EditFileTool,
            preview_edit: PreviewEditTool,
        }
    }

    #[must_use]
    pub fn executor(&self, kind: ToolKind) -> &dyn ToolExecutor {
        match kind {
            ToolKind::ReadFile => &self.read_file,
            ToolKind::ListFiles => &self.list_files,
            ToolKind::BashCommand => &self.bash_command,
            ToolKind::BashBackground => &self.bash_background,
            ToolKind::SearchCode => &self.search_code,
            ToolKind::EditFile => &self.edit_file,
            ToolKind::PreviewEdit => &self.preview_edit,
        }
    }

    pub fn lookup(&self, name: &str) -> Result<ToolKind, ToolError> {
        ToolKind::from_name(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })
    }

    /// Function-calling schema for every model-facing tool.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolKind::MODEL_FACING
            .into_iter()
            .map(|kind| {
                let executor = self.executor(kind);
                ToolDefinition::new(kind.name(), executor.description(), executor.schema())
            })
            .collect()
    }

    pub async fn execute(
        &self,
        kind: ToolKind,
        args: Value,
        ctx: &ToolCtx,
    ) -> Result<String, ToolError> {
        debug!(tool = kind.name(), "executing tool");
        let result = self.executor(kind).execute(args, ctx).await;
        if let Err(e) = &result {
            warn!(tool = kind.name(), error = %e, "tool failed");
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(&ToolSettings::default())
    }
}
