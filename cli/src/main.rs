//! mcode - a terminal coding agent for OpenAI-compatible model servers.
//!
//! ```text
//! mcode                 interactive session
//! mcode <message...>    run one turn and exit
//! ```
//!
//! Logs go to `~/.mcode/logs/mcode.log` so they never interleave with the
//! conversation on stdout.

mod console;
mod render;
mod repl;

use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use mcode_engine::{McodeConfig, config_path, mcode_dir};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use repl::Repl;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than write into the conversation.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = mcode_dir() {
        candidates.push(dir.join("logs").join("mcode.log"));
    }
    candidates.push(PathBuf::from(".mcode").join("logs").join("mcode.log"));
    candidates
}

fn load_config() -> (McodeConfig, Option<PathBuf>) {
    let Some(path) = config_path() else {
        warn!("No home directory; using built-in defaults without persistence");
        return (McodeConfig::default(), None);
    };
    match McodeConfig::load_or_create(&path) {
        Ok(config) => (config, Some(path)),
        Err(e) => {
            error!(error = %e, "Failed to load config");
            eprintln!("Warning: {e}. Using built-in defaults.");
            (McodeConfig::default(), None)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let (config, path) = load_config();
    let working_dir = env::current_dir().context("failed to read the current directory")?;
    let mut repl = Repl::new(config, path, working_dir)?;

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        repl.run().await;
        return Ok(ExitCode::SUCCESS);
    }

    let message = args.join(" ");
    match repl.send(&message).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Turn failed");
            println!("Error: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    run().await
}
