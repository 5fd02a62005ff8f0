//! Core engine for mcode: the conversation loop and the state around it.
//!
//! This crate has no terminal dependencies. The caller supplies an
//! [`Operator`] for confirmations and a [`ProgressSink`] for everything the
//! user should see, and owns the [`Session`] a turn mutates.

pub mod commands;
mod config;
mod conversation;
pub mod history;
mod operator;
mod permissions;
mod progress;
pub mod project;
mod prompt;
mod session;
pub mod spinner;

pub use commands::{Command, Input, ModelsAction, PermissionsAction};
pub use config::{
    ConfigError, ContextConfig, McodeConfig, ModelConfig, ToolsConfig, config_path,
    expand_env_vars, mcode_dir, persist_approved_folders, persist_current_model,
};
pub use conversation::{ConversationLoop, MAX_ROUNDS, TurnError, TurnOutcome};
pub use operator::{Decision, Operator, OperatorFut};
pub use permissions::{
    ApprovedFolderSet, ConfigFolderStore, FolderStore, NoopFolderStore, PermissionGate,
    normalize_path,
};
pub use progress::{NullSink, Progress, ProgressSink};
pub use project::{InstructionAdded, ProjectError, ProjectFiles};
pub use prompt::system_prompt;
pub use session::Session;

pub use mcode_providers::{self, ChatRequest, ChatResponse, ModelClient, ModelError, OpenAiClient};
pub use mcode_tools::{self, ToolRegistry, ToolSettings};
pub use mcode_types::{self, Message, TokenUsage, ToolCall};
