//! Shell selection for `bash_command`.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

/// `[tools.shell]` override from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ShellConfig {
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
}

/// Detected shell for command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedShell {
    /// Path or name of the shell binary.
    pub binary: PathBuf,
    /// Arguments to pass before the command (e.g., `["-c"]`).
    pub args: Vec<String>,
    /// Human-readable name for logging.
    pub name: String,
}

impl DetectedShell {
    /// Build a command that runs `script` through this shell.
    #[must_use]
    pub fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args).arg(script);
        cmd
    }
}

impl fmt::Display for DetectedShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Pick the shell for command execution.
///
/// Priority: config override, then `$SHELL`, then `bash` on the `PATH`, then
/// `/bin/sh`.
#[must_use]
pub fn detect_shell(config: Option<&ShellConfig>) -> DetectedShell {
    if let Some(cfg) = config
        && let Some(binary) = &cfg.binary
    {
        let args = cfg.args.clone().unwrap_or_else(|| default_args_for(binary));
        return DetectedShell {
            binary: PathBuf::from(binary),
            args,
            name: "configured".into(),
        };
    }

    detect_platform_shell()
}

fn default_args_for(binary: &str) -> Vec<String> {
    let name = Path::new(binary)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(binary)
        .to_lowercase();

    match name.as_str() {
        "cmd" => vec!["/C".to_string()],
        "pwsh" | "powershell" => vec!["-NoProfile".to_string(), "-Command".to_string()],
        _ => vec!["-c".to_string()],
    }
}

#[cfg(windows)]
fn detect_platform_shell() -> DetectedShell {
    let comspec = env::var("ComSpec")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(r"C:\Windows\System32\cmd.exe"));
    DetectedShell {
        binary: comspec,
        args: vec!["/C".to_string()],
        name: "cmd".into(),
    }
}

#[cfg(not(windows))]
fn detect_platform_shell() -> DetectedShell {
    if let Ok(shell) = env::var("SHELL") {
        let path = Path::new(&shell);
        if path.exists() {
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("user-shell")
                .to_string();
            return DetectedShell {
                binary: PathBuf::from(&shell),
                args: vec!["-c".to_string()],
                name,
            };
        }
    }

    if let Ok(path) = which::which("bash") {
        return DetectedShell {
            binary: path,
            args: vec!["-c".to_string()],
            name: "bash".into(),
        };
    }

    DetectedShell {
        binary: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string()],
        name: "sh".into(),
    }
}
