//! Configuration management for patchsmith
//!
//! Global settings live in ~/.config/patchsmith/config.json; a workspace may
//! override runner settings with a `.patchsmith.toml` at its root.

use anyhow::{Context, Result};
use patchsmith_core::patch::PatchFormat;
use patchsmith_core::{ProviderCapabilities, RecoveryPolicy, ResponseMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKSPACE_OVERRIDE_FILE: &str = ".patchsmith.toml";
pub const DEFAULT_API_KEY_ENV: &str = "PATCHSMITH_API_KEY";

/// An OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4.1".to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            capabilities: ProviderCapabilities::default(),
        }
    }
}

impl ProviderSettings {
    /// API key from the configured variable, then the generic fallbacks.
    pub fn api_key(&self) -> Option<String> {
        [self.api_key_env.as_str(), DEFAULT_API_KEY_ENV, "OPENAI_API_KEY"]
            .into_iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default = "default_initial_format")]
    pub initial_format: PatchFormat,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

fn default_initial_format() -> PatchFormat {
    PatchFormat::SearchReplace
}

fn default_max_tool_iterations() -> usize {
    8
}

fn default_tool_timeout_secs() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            response_mode: ResponseMode::default(),
            initial_format: default_initial_format(),
            max_tool_iterations: default_max_tool_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Secondary model used to reinterpret non-conforming output. Defaults to
    /// `provider` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<ProviderSettings>,
    #[serde(default)]
    pub runner: RunnerSettings,
}

/// Per-workspace overrides read from `.patchsmith.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct WorkspaceOverrides {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    interpreter_model: Option<String>,
    #[serde(default)]
    runner: RunnerOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RunnerOverrides {
    response_mode: Option<ResponseMode>,
    initial_format: Option<PatchFormat>,
    max_tool_iterations: Option<usize>,
    tool_timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    recovery: Option<RecoveryPolicy>,
}

impl Config {
    fn sanitize(&mut self) {
        self.runner.max_tool_iterations = self.runner.max_tool_iterations.clamp(1, 64);
        self.runner.tool_timeout_secs = self.runner.tool_timeout_secs.max(1);
        self.runner.max_tokens = self.runner.max_tokens.max(256);
        if !self.runner.temperature.is_finite() {
            self.runner.temperature = default_temperature();
        }
        self.runner.temperature = self.runner.temperature.clamp(0.0, 2.0);
        let base = self.provider.base_url.trim().trim_end_matches('/').to_string();
        self.provider.base_url = if base.is_empty() {
            default_base_url()
        } else {
            base
        };
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchsmith"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`. A corrupt file is moved aside and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<Config>(&content) {
                Ok(mut config) => {
                    config.sanitize();
                    return config;
                }
                Err(err) => {
                    preserve_corrupt_config(path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config file was corrupted; a backup was saved and defaults were loaded"
                    );
                }
            }
        }
        Self::default()
    }

    /// Global config with the workspace's `.patchsmith.toml` applied on top.
    pub fn load_for_workspace(root: &Path) -> Result<Self> {
        let mut config = Self::load();
        config.apply_workspace_overrides(root)?;
        Ok(config)
    }

    pub fn apply_workspace_overrides(&mut self, root: &Path) -> Result<()> {
        let path = root.join(WORKSPACE_OVERRIDE_FILE);
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let overrides: WorkspaceOverrides = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(model) = overrides.model {
            self.provider.model = model;
        }
        if let Some(model) = overrides.interpreter_model {
            let mut interpreter = self
                .interpreter
                .clone()
                .unwrap_or_else(|| self.provider.clone());
            interpreter.model = model;
            self.interpreter = Some(interpreter);
        }
        let runner = overrides.runner;
        if let Some(mode) = runner.response_mode {
            self.runner.response_mode = mode;
        }
        if let Some(format) = runner.initial_format {
            self.runner.initial_format = format;
        }
        if let Some(cap) = runner.max_tool_iterations {
            self.runner.max_tool_iterations = cap;
        }
        if let Some(secs) = runner.tool_timeout_secs {
            self.runner.tool_timeout_secs = secs;
        }
        if let Some(max_tokens) = runner.max_tokens {
            self.runner.max_tokens = max_tokens;
        }
        if let Some(temperature) = runner.temperature {
            self.runner.temperature = temperature;
        }
        if let Some(recovery) = runner.recovery {
            self.runner.recovery = recovery;
        }
        self.sanitize();
        tracing::debug!(path = %path.display(), "applied workspace overrides");
        Ok(())
    }

    /// Settings for the secondary interpreter model.
    pub fn interpreter_settings(&self) -> &ProviderSettings {
        self.interpreter.as_ref().unwrap_or(&self.provider)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserializes_partial_shape_with_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"provider":{"model":"local-coder"}}"#).unwrap();
        assert_eq!(parsed.provider.model, "local-coder");
        assert_eq!(parsed.provider.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(parsed.runner, RunnerSettings::default());
        assert!(parsed.interpreter.is_none());
    }

    #[test]
    fn test_config_loaded_from_disk_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"provider":{"base_url":"http://localhost:8080/v1/"},"runner":{"response_mode":"patch_json","max_tool_iterations":0}}"#,
        )
        .unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.runner.max_tool_iterations, 1);
        assert_eq!(loaded.runner.response_mode, ResponseMode::PatchJson);
        assert_eq!(loaded.provider.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_corrupt_config_is_preserved_and_defaults_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded, Config::default());
        assert!(dir.path().join("config.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_overrides_apply_on_top() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(WORKSPACE_OVERRIDE_FILE),
            r#"
model = "workspace-model"
interpreter_model = "small-fixer"

[runner]
response_mode = "freeform"
initial_format = "file_writes"
max_tool_iterations = 500

[runner.recovery]
search_miss = "fatal"
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_workspace_overrides(dir.path()).unwrap();
        assert_eq!(config.provider.model, "workspace-model");
        assert_eq!(config.interpreter_settings().model, "small-fixer");
        assert_eq!(config.runner.response_mode, ResponseMode::Freeform);
        assert_eq!(config.runner.initial_format, PatchFormat::FileWrites);
        assert_eq!(config.runner.max_tool_iterations, 64);
        assert_eq!(
            config.runner.recovery.search_miss,
            patchsmith_core::MatchFailureAction::Fatal
        );
    }

    #[test]
    fn test_missing_workspace_override_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.apply_workspace_overrides(dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_workspace_override_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(WORKSPACE_OVERRIDE_FILE), "runner = 3").unwrap();
        let mut config = Config::default();
        assert!(config.apply_workspace_overrides(dir.path()).is_err());
    }
}
