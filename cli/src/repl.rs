//! Interactive session: input dispatch and slash-command handlers.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use mcode_engine::commands::{command_help_summary, command_specs};
use mcode_engine::project::export_file_name;
use mcode_engine::{
    Command, ConfigFolderStore, ConversationLoop, FolderStore, Input, InstructionAdded,
    McodeConfig, ModelClient, ModelConfig, ModelsAction, NoopFolderStore, OpenAiClient,
    PermissionGate, PermissionsAction, ProjectError, ProjectFiles, Session, ToolRegistry,
    TurnError, TurnOutcome, persist_current_model,
};
use tracing::{info, warn};

use crate::console::{Console, TerminalOperator};
use crate::render::{TerminalSink, context_prompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Repl {
    config: McodeConfig,
    config_path: Option<PathBuf>,
    session: Session,
    conversation: ConversationLoop,
    project: ProjectFiles,
    console: Arc<Console>,
    sink: Arc<TerminalSink>,
}

fn model_client(model: &ModelConfig) -> Arc<dyn ModelClient> {
    Arc::new(OpenAiClient::new(
        model.base_url.clone(),
        model.api_key().unwrap_or_default(),
    ))
}

impl Repl {
    pub fn new(
        mut config: McodeConfig,
        config_path: Option<PathBuf>,
        working_dir: PathBuf,
    ) -> Result<Self> {
        let (key, model) = config
            .active_model()
            .map(|(key, model)| (key.to_string(), model.clone()))
            .context("no models configured")?;
        config.current_model = key.clone();

        let console = Arc::new(Console::new());
        let sink = Arc::new(TerminalSink::new(&key));
        let operator = Arc::new(TerminalOperator::new(Arc::clone(&console)));
        let project = ProjectFiles::new(&working_dir);

        let conversation = ConversationLoop::new(
            model_client(&model),
            &model.name,
            ToolRegistry::new(&config.tools.settings()),
            operator,
            sink.clone(),
        )
        .with_context_config(config.context.clone())
        .with_project(project.clone());

        let store: Box<dyn FolderStore> = match &config_path {
            Some(path) => Box::new(ConfigFolderStore::new(path)),
            None => Box::new(NoopFolderStore),
        };
        let gate = PermissionGate::new(&working_dir, &config.approved_folders, store);

        info!(model = %key, dir = %working_dir.display(), "Session started");
        Ok(Self {
            config,
            config_path,
            session: Session::new(gate),
            conversation,
            project,
            console,
            sink,
        })
    }

    /// Run one turn and finish the output line.
    pub async fn send(&mut self, message: &str) -> Result<TurnOutcome, TurnError> {
        let outcome = self
            .conversation
            .run_turn(&mut self.session, message)
            .await;
        println!();
        outcome
    }

    pub async fn run(&mut self) {
        self.banner();
        loop {
            let prompt = context_prompt(self.session.context_tokens());
            let Some(line) = self.console.read_line(&prompt).await else {
                break;
            };
            match Input::parse(&line) {
                Input::Empty => {}
                Input::Exit => break,
                Input::Command(command) => {
                    if self.handle_command(command).await == Flow::Exit {
                        break;
                    }
                }
                Input::Instruction(instruction) => self.add_instruction(instruction).await,
                Input::Message(message) => {
                    if let Err(e) = self.send(message).await {
                        println!("{}", format!("Error: {e}").red());
                    }
                }
            }
        }
    }

    fn banner(&self) {
        if let Some((key, model)) = self.config.active_model() {
            println!("MCode CLI - Connected to {}", model.base_url);
            println!("Model: {} ({key})", model.name);
        }
        println!(
            "Enter your message (type '/help' for commands, '#instruction' for permanent memory, 'exit' to quit):"
        );
    }

    async fn handle_command(&mut self, command: Command<'_>) -> Flow {
        match command {
            Command::Exit => {
                println!("👋 Goodbye!");
                return Flow::Exit;
            }
            Command::New => self.clear_context(),
            Command::Export(file) => self.export(file).await,
            Command::Models(action) => self.models(action),
            Command::Permissions(action) => self.permissions(action),
            Command::Init => self.init().await,
            Command::Help => show_help(),
            Command::Unknown(name) => {
                println!("❌ Unknown command: /{name}");
                println!("{}", command_help_summary());
            }
            Command::Empty => println!("{}", command_help_summary()),
        }
        Flow::Continue
    }

    fn clear_context(&mut self) {
        self.session.clear();
        let mut out = io::stdout();
        let _ = execute!(out, Clear(ClearType::All), MoveTo(0, 0));
        println!(
            "{}",
            "🔄 Conversation context cleared - Starting fresh!".green()
        );
    }

    async fn export(&self, file: Option<&str>) {
        let name = export_file_name(file);
        println!("📤 Exporting context to {name}...");
        let result = self
            .project
            .export(
                file,
                &self.session.conversation,
                self.session.last_usage,
                self.session.total_tokens,
                Local::now(),
            )
            .await;
        match result {
            Ok(path) => {
                println!("✅ Context exported successfully!");
                println!("📄 File: {}", path.display());
                println!("📊 Messages: {}", self.session.conversation.len());
                let tokens = self.session.context_tokens();
                if tokens > 0 {
                    println!("🔢 Context tokens: {tokens}");
                }
            }
            Err(ProjectError::NothingToExport) => {
                println!("{}", "❌ No conversation context to export".red());
            }
            Err(e) => println!("{}", format!("Error: {e}").red()),
        }
    }

    fn models(&mut self, action: ModelsAction<'_>) {
        match action {
            ModelsAction::List => self.list_models(),
            ModelsAction::Switch(key) => self.switch_model(key),
            ModelsAction::Usage => {
                println!("Usage:");
                println!("  /models           - List available models");
                println!("  /models <name>    - Switch to model");
            }
        }
    }

    fn list_models(&self) {
        println!("\n🤖 Available Models");
        println!("==================");
        for (key, model) in &self.config.models {
            let status = if *key == self.config.current_model {
                " (current)"
            } else {
                ""
            };
            println!("📱 {key}{status}");
            println!("   Name: {}", model.name);
            println!("   URL:  {}", model.base_url);
            println!("   API Key: {}", model.masked_api_key());
            println!();
        }
    }

    fn switch_model(&mut self, key: &str) {
        let Some(model) = self.config.models.get(key).cloned() else {
            println!("❌ Model '{key}' not found");
            println!("Available models:");
            for key in self.config.models.keys() {
                println!("  - {key}");
            }
            return;
        };

        if let Some(path) = &self.config_path
            && let Err(e) = persist_current_model(path, key)
        {
            warn!(error = %e, "Failed to save current model");
            println!("{}", format!("Error: failed to save config: {e}").red());
            return;
        }
        self.config.current_model = key.to_string();
        self.conversation.set_model(&model.name, model_client(&model));
        self.sink.set_model(key);
        info!(model = %key, "Switched model");

        println!("✅ Switched to model: {key}");
        println!("📱 Name: {}", model.name);
        println!("🌐 URL: {}", model.base_url);
    }

    fn permissions(&mut self, action: PermissionsAction<'_>) {
        match action {
            PermissionsAction::List => self.list_permissions(),
            PermissionsAction::Remove(path) => self.remove_permission(Path::new(path)),
            PermissionsAction::Usage => {
                println!("Usage:");
                println!("  /permissions           - List approved folders");
                println!("  /permissions remove <path> - Remove folder permission");
            }
        }
    }

    fn list_permissions(&self) {
        println!("\n🔒 Approved Folders");
        println!("===================");
        let approved = self.session.gate.approved();
        if approved.is_empty() {
            println!("No folders have been approved yet.");
            return;
        }
        for (i, folder) in approved.iter().enumerate() {
            println!("{}. {}", i + 1, folder.display());
        }
        println!("\nTotal: {} folder(s)", approved.len());
    }

    fn remove_permission(&mut self, folder: &Path) {
        match self.session.gate.revoke(folder) {
            Ok(Some(removed)) => {
                println!("✅ Removed folder permission: {}", removed.display());
            }
            Ok(None) => {
                let resolved = self.session.gate.resolve(folder);
                println!("❌ Folder not found in approved list: {}", resolved.display());
            }
            Err(e) => println!("{}", format!("Error: failed to save config: {e}").red()),
        }
    }

    async fn init(&self) {
        println!("🚀 Analyzing project and initializing...");
        if self.project.agents_path().exists() {
            let answer = self
                .console
                .read_line("⚠️  AGENTS.md already exists. Overwrite? (y/n): ")
                .await
                .unwrap_or_default();
            if answer.trim().to_lowercase() != "y" {
                println!("❌ Project initialization cancelled");
                return;
            }
        }

        match self.project.init(Local::now()).await {
            Ok(path) => {
                println!("✅ Project initialized!");
                println!("📄 Created: {}", path.display());
                println!("📂 Project: {}", self.project.project_name());
            }
            Err(e) => println!("{}", format!("Error: {e}").red()),
        }
    }

    async fn add_instruction(&self, instruction: &str) {
        if instruction.is_empty() {
            println!("❌ Please provide an instruction after #");
            return;
        }
        println!("💾 Adding permanent instruction: {instruction}");
        match self
            .project
            .add_permanent_instruction(instruction, Local::now())
            .await
        {
            Ok(added) => {
                if added == InstructionAdded::CreatedFile {
                    println!("📄 AGENTS.md not found, created it with the basic template");
                }
                println!("✅ Permanent instruction saved to AGENTS.md");
            }
            Err(e) => println!("{}", format!("Error saving instruction: {e}").red()),
        }
    }
}

fn show_help() {
    println!("\n🤖 MCode CLI - Help");
    println!("========================");
    println!();
    println!("Slash Commands:");
    for spec in command_specs() {
        println!("  /{:<12} - {}", spec.label, spec.description);
    }
    println!();
    println!("Available Tools:");
    println!("  📖 read_file    - Read file contents");
    println!("  📁 list_files   - List directory contents");
    println!("  ⚡ bash_command - Execute shell commands");
    println!("  ✏️ edit_file    - Create/modify files (shows colored diffs)");
    println!("  👀 preview_edit - Preview an edit as a diff without writing");
    println!("  🔍 search_code  - Search for code patterns");
    println!();
    println!("Usage:");
    println!("  - Type natural language requests for coding tasks");
    println!("  - Review and approve tool executions (Y/n/s/i/b)");
    println!("    • Y/Enter: Execute tool (default)");
    println!("    • n: Deny execution");
    println!("    • s: Skip execution");
    println!("    • i: Interrupt and provide alternative instruction");
    println!("    • b: Background execution (for long-running commands)");
    println!("  - Use slash commands for special operations");
    println!("  - Use /new to start a fresh conversation");
    println!("  - Use # commands to add permanent instructions");
    println!("    Example: #always use python3 instead of python");
    println!();
    let _ = io::stdout().flush();
}
