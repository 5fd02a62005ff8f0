//! TOML configuration at `~/.mcode/config.toml`.
//!
//! ```toml
//! current_model = "qwen3-coder"
//! approved_folders = ["/home/me/project"]
//!
//! [models.qwen3-coder]
//! name = "lmstudio-community/qwen3-coder-30b-a3b-instruct-mlx@8bit"
//! base_url = "http://localhost:1234/v1"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [context]
//! high_water_tokens = 25000
//!
//! [tools]
//! run_timeout_secs = 30
//! shell = "/bin/bash"
//! ```
//!
//! Runtime changes (`/models <name>`, folder grants) are written back with
//! `toml_edit`, touching only the changed key so comments survive.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcode_tools::{ShellConfig, ToolSettings, builtins, detect_shell};
use mcode_utils::{PersistMode, atomic_write_with_mode};
use serde::{Deserialize, Serialize};
use toml_edit::{Array, DocumentMut, TomlError};
use tracing::{info, warn};

const DEFAULT_MODEL: &str = "qwen3-coder";
const LOCAL_BASE_URL: &str = "http://localhost:1234/v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to edit config at {}: {source}", path.display())]
    Edit { path: PathBuf, source: TomlError },
    #[error("failed to write config at {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Edit { path, .. }
            | ConfigError::Write { path, .. } => Some(path),
            ConfigError::Serialize(_) => None,
        }
    }
}

/// One OpenAI-compatible endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent in requests.
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Keep keys out of logs.
impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &if self.api_key.is_some() {
                    "[REDACTED]"
                } else {
                    "None"
                },
            )
            .finish()
    }
}

impl ModelConfig {
    fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: LOCAL_BASE_URL.to_string(),
            api_key: None,
        }
    }

    fn hosted(name: &str, base_url: &str, key_var: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key: Some(format!("${{{key_var}}}")),
        }
    }

    /// The API key after environment expansion. Empty keys count as absent.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }

    /// Masked key for display: `***` plus the last four characters.
    #[must_use]
    pub fn masked_api_key(&self) -> String {
        match self.api_key() {
            None => "(none)".to_string(),
            Some(key) => {
                let chars: Vec<char> = key.chars().collect();
                if chars.len() > 4 {
                    let tail: String = chars[chars.len() - 4..].iter().collect();
                    format!("***{tail}")
                } else {
                    "***".to_string()
                }
            }
        }
    }
}

/// Context-size control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Prompt size above which history is trimmed before the next request.
    pub high_water_tokens: u32,
    /// Non-system messages kept by a trim.
    pub keep_recent: usize,
    /// Model context window used to size responses.
    pub window_tokens: u32,
    pub max_response_tokens: u32,
    pub min_response_tokens: u32,
    /// Response budget for the simplified retry request.
    pub fallback_response_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            high_water_tokens: 25_000,
            keep_recent: 6,
            window_tokens: 32_000,
            max_response_tokens: 8_000,
            min_response_tokens: 1_000,
            fallback_response_tokens: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Hard limit for `bash_command`.
    pub run_timeout_secs: u64,
    /// Shell binary override; otherwise `$SHELL`, then bash, then sh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_args: Option<Vec<String>>,
    pub max_search_matches: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 30,
            shell: None,
            shell_args: None,
            max_search_matches: builtins::DEFAULT_MAX_SEARCH_MATCHES,
        }
    }
}

impl ToolsConfig {
    #[must_use]
    pub fn settings(&self) -> ToolSettings {
        let shell = ShellConfig {
            binary: self.shell.clone(),
            args: self.shell_args.clone(),
        };
        ToolSettings {
            run_timeout: Duration::from_secs(self.run_timeout_secs.max(1)),
            shell: detect_shell(Some(&shell)),
            max_search_matches: self.max_search_matches.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McodeConfig {
    #[serde(default = "default_model_key")]
    pub current_model: String,
    #[serde(default)]
    pub approved_folders: Vec<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_model_key() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for McodeConfig {
    fn default() -> Self {
        let models = BTreeMap::from([
            (
                "qwen3-coder".to_string(),
                ModelConfig::local("lmstudio-community/qwen3-coder-30b-a3b-instruct-mlx@8bit"),
            ),
            (
                "hermes-3".to_string(),
                ModelConfig::local("NousResearch/Hermes-3-Llama-3.1-8B-GGUF"),
            ),
            (
                "llama-3.2".to_string(),
                ModelConfig::local("bartowski/Llama-3.2-3B-Instruct-GGUF"),
            ),
            (
                "claude".to_string(),
                ModelConfig::hosted(
                    "claude-3-5-sonnet-20241022",
                    "https://api.anthropic.com/v1",
                    "ANTHROPIC_API_KEY",
                ),
            ),
            (
                "openai".to_string(),
                ModelConfig::hosted("gpt-4", "https://api.openai.com/v1", "OPENAI_API_KEY"),
            ),
        ]);
        Self {
            current_model: default_model_key(),
            approved_folders: Vec::new(),
            models,
            context: ContextConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl McodeConfig {
    /// Load `path`, writing the defaults there first if it does not exist.
    ///
    /// `${VAR}` references in API keys are expanded after loading; the file
    /// keeps the references.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|source| {
                warn!(path = %path.display(), %source, "Failed to read config");
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            toml::from_str(&content).map_err(|source| {
                warn!(path = %path.display(), %source, "Failed to parse config");
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?
        } else {
            let config = Self::default();
            let serialized = toml::to_string_pretty(&config)?;
            write_config(path, &serialized)?;
            info!(path = %path.display(), "Wrote default config");
            config
        };
        Ok(config.expanded())
    }

    fn expanded(mut self) -> Self {
        for model in self.models.values_mut() {
            if let Some(key) = &model.api_key {
                model.api_key = Some(expand_env_vars(key));
            }
        }
        self
    }

    /// The configured current model, or the first model when the key is stale.
    #[must_use]
    pub fn active_model(&self) -> Option<(&str, &ModelConfig)> {
        if let Some(model) = self.models.get(&self.current_model) {
            return Some((self.current_model.as_str(), model));
        }
        let (key, model) = self.models.iter().next()?;
        warn!(
            current = %self.current_model,
            fallback = %key,
            "Current model not found, using first available model"
        );
        Some((key.as_str(), model))
    }
}

/// Set `current_model`, preserving the rest of the file.
pub fn persist_current_model(path: &Path, model: &str) -> Result<(), ConfigError> {
    edit_config(path, |doc| {
        doc["current_model"] = toml_edit::value(model);
    })
}

/// Replace `approved_folders`, preserving the rest of the file.
pub fn persist_approved_folders(path: &Path, folders: &[String]) -> Result<(), ConfigError> {
    edit_config(path, |doc| {
        let array: Array = folders.iter().map(String::as_str).collect();
        doc["approved_folders"] = toml_edit::value(array);
    })
}

fn edit_config(path: &Path, edit: impl FnOnce(&mut DocumentMut)) -> Result<(), ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut doc = content
        .parse::<DocumentMut>()
        .map_err(|source| ConfigError::Edit {
            path: path.to_path_buf(),
            source,
        })?;
    edit(&mut doc);
    write_config(path, &doc.to_string())
}

fn write_config(path: &Path, content: &str) -> Result<(), ConfigError> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        atomic_write_with_mode(path, content.as_bytes(), PersistMode::SensitiveOwnerOnly)
    };
    write().map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Expand `${VAR}` references from the environment. Unset variables expand
/// to nothing; an unclosed `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// `~/.mcode`, or `None` when the home directory is unknown.
#[must_use]
pub fn mcode_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mcode"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    mcode_dir().map(|dir| dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("MCODE_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${MCODE_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            env::remove_var("MCODE_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("MCODE_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${MCODE_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_adjacent_vars() {
        unsafe {
            env::set_var("MCODE_ADJ_A", "X");
            env::set_var("MCODE_ADJ_B", "Y");
        }
        assert_eq!(expand_env_vars("${MCODE_ADJ_A}${MCODE_ADJ_B}"), "XY");
        unsafe {
            env::remove_var("MCODE_ADJ_A");
            env::remove_var("MCODE_ADJ_B");
        }
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_removed() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        unsafe {
            env::set_var("MCODE_UNICODE_VAR", "🦀");
        }
        assert_eq!(
            expand_env_vars("Hello ${MCODE_UNICODE_VAR} Rust"),
            "Hello 🦀 Rust"
        );
        unsafe {
            env::remove_var("MCODE_UNICODE_VAR");
        }
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = McodeConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.current_model, "qwen3-coder");
        assert_eq!(config.models.len(), 5);
        for key in ["qwen3-coder", "hermes-3", "llama-3.2", "claude", "openai"] {
            assert!(config.models.contains_key(key), "missing {key}");
        }

        let reloaded = McodeConfig::load_or_create(&path).unwrap();
        assert_eq!(reloaded.models.len(), 5);
        assert_eq!(reloaded.context, ContextConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "current_model = \"local\"\n\n[models.local]\nname = \"m\"\nbase_url = \"http://localhost:8080/v1\"\n\n[context]\nkeep_recent = 4\n",
        )
        .unwrap();

        let config = McodeConfig::load_or_create(&path).unwrap();
        assert_eq!(config.context.keep_recent, 4);
        assert_eq!(config.context.high_water_tokens, 25_000);
        assert_eq!(config.tools.run_timeout_secs, 30);
        assert!(config.approved_folders.is_empty());
        let (key, model) = config.active_model().unwrap();
        assert_eq!(key, "local");
        assert_eq!(model.api_key(), None);
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "current_model = [").unwrap();

        let err = McodeConfig::load_or_create(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn api_keys_expand_from_environment() {
        unsafe {
            env::set_var("MCODE_TEST_KEY", "sk-abcdef123456");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[models.hosted]\nname = \"gpt\"\nbase_url = \"https://example.com/v1\"\napi_key = \"${MCODE_TEST_KEY}\"\n",
        )
        .unwrap();

        let config = McodeConfig::load_or_create(&path).unwrap();
        let model = &config.models["hosted"];
        assert_eq!(model.api_key(), Some("sk-abcdef123456"));
        assert_eq!(model.masked_api_key(), "***3456");
        assert!(!format!("{model:?}").contains("sk-abcdef"));
        unsafe {
            env::remove_var("MCODE_TEST_KEY");
        }
    }

    #[test]
    fn stale_current_model_falls_back_to_first() {
        let config = McodeConfig {
            current_model: "gone".to_string(),
            ..McodeConfig::default()
        };
        let (key, _) = config.active_model().unwrap();
        assert_eq!(key, "claude");
    }

    #[test]
    fn masked_key_variants() {
        let mut model = ModelConfig::local("m");
        assert_eq!(model.masked_api_key(), "(none)");
        model.api_key = Some("abc".to_string());
        assert_eq!(model.masked_api_key(), "***");
        model.api_key = Some(String::new());
        assert_eq!(model.masked_api_key(), "(none)");
    }

    #[test]
    fn persist_touches_only_the_changed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "# my settings\ncurrent_model = \"a\"\n\n[models.a]\nname = \"m\" # keep me\nbase_url = \"http://x\"\n",
        )
        .unwrap();

        persist_current_model(&path, "b").unwrap();
        persist_approved_folders(&path, &["/tmp/one".to_string(), "/tmp/two".to_string()])
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("# my settings"));
        assert!(content.contains("# keep me"));
        assert!(content.contains("current_model = \"b\""));

        let config: McodeConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.approved_folders, vec!["/tmp/one", "/tmp/two"]);
        assert_eq!(config.models["a"].name, "m");
    }

    #[test]
    fn persist_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.toml");
        persist_current_model(&path, "hermes-3").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("current_model = \"hermes-3\""));
    }

    #[test]
    fn tools_config_builds_settings() {
        let tools = ToolsConfig {
            run_timeout_secs: 5,
            shell: Some("/bin/sh".to_string()),
            shell_args: None,
            max_search_matches: 10,
        };
        let settings = tools.settings();
        assert_eq!(settings.run_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_search_matches, 10);
        assert_eq!(settings.shell.binary, PathBuf::from("/bin/sh"));
    }
}
