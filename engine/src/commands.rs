//! REPL input parsing: slash commands, `#` instructions and plain messages.

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub label: &'static str,
    pub description: &'static str,
}

const COMMAND_SPECS: &[CommandSpec] = &[
    CommandSpec {
        label: "exit",
        description: "Exit the agent",
    },
    CommandSpec {
        label: "init",
        description: "Initialize project and create AGENTS.md",
    },
    CommandSpec {
        label: "new",
        description: "Clear conversation context (start fresh)",
    },
    CommandSpec {
        label: "export",
        description: "Export conversation context to text file",
    },
    CommandSpec {
        label: "models",
        description: "List or switch between available models",
    },
    CommandSpec {
        label: "permissions",
        description: "Manage folder permissions",
    },
    CommandSpec {
        label: "help",
        description: "Show this help message",
    },
];

#[must_use]
pub fn command_specs() -> &'static [CommandSpec] {
    COMMAND_SPECS
}

#[must_use]
pub fn command_help_summary() -> String {
    let labels: Vec<&str> = COMMAND_SPECS.iter().map(|spec| spec.label).collect();
    format!("Available commands: /{}", labels.join(", /"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelsAction<'a> {
    List,
    Switch(&'a str),
    Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionsAction<'a> {
    List,
    Remove(&'a str),
    Usage,
}

/// Parsed slash command with typed arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Exit,
    New,
    Export(Option<&'a str>),
    Models(ModelsAction<'a>),
    Permissions(PermissionsAction<'a>),
    Init,
    Help,
    Unknown(&'a str),
    Empty,
}

impl<'a> Command<'a> {
    /// Parse a command line, with or without its leading `/`.
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_prefix('/').unwrap_or(raw);
        let parts: Vec<&str> = raw.split_whitespace().collect();

        match parts.first().copied() {
            Some("exit" | "quit") => Command::Exit,
            Some("new") => Command::New,
            Some("export") => Command::Export(parts.get(1).copied()),
            Some("models") => Command::Models(match parts[..] {
                [_] => ModelsAction::List,
                [_, name] => ModelsAction::Switch(name),
                _ => ModelsAction::Usage,
            }),
            Some("permissions") => Command::Permissions(match parts[..] {
                [_] => PermissionsAction::List,
                [_, "remove", path] => PermissionsAction::Remove(path),
                _ => PermissionsAction::Usage,
            }),
            Some("init") => Command::Init,
            Some("help") => Command::Help,
            Some(cmd) => Command::Unknown(cmd),
            None => Command::Empty,
        }
    }
}

/// One line typed at the REPL prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    /// Bare `exit` or `quit`.
    Exit,
    Command(Command<'a>),
    /// `#text`: a permanent instruction for AGENTS.md.
    Instruction(&'a str),
    Message(&'a str),
}

impl<'a> Input<'a> {
    #[must_use]
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        if line == "exit" || line == "quit" {
            return Input::Exit;
        }
        if line.starts_with('/') {
            return Input::Command(Command::parse(line));
        }
        if let Some(instruction) = line.strip_prefix('#') {
            return Input::Instruction(instruction.trim());
        }
        Input::Message(line)
    }
}
