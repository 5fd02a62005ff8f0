//! Classification of shell commands that are likely to keep running.
//!
//! Servers, watchers and interpreters can block `bash_command` until its
//! timeout. These are the only commands the operator is offered to start in
//! the background.

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;

const LONG_RUNNING_KEYWORDS: &[&str] = &[
    "python",
    "python3",
    "node",
    "npm start",
    "npm run",
    "go run",
    "serve",
    "server",
    "uvicorn",
    "gunicorn",
    "flask run",
    "rails server",
    "php -s",
    "java -jar",
    "./",
    "watch",
    "tail -f",
    "ping",
    "sleep",
    "while true",
];

static KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new(LONG_RUNNING_KEYWORDS).expect("static keyword set is valid")
});

static CURL_WRITE_OUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"curl.*-w").expect("static regex is valid"));

/// Whether `command` looks like it will not exit on its own.
#[must_use]
pub fn is_long_running(command: &str) -> bool {
    let lowered = command.to_lowercase();
    KEYWORDS.is_match(&lowered) || CURL_WRITE_OUT.is_match(&lowered)
}
