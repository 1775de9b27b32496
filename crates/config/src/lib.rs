//! Configuration loading, validation, and per-request overrides for Kestrel.
//!
//! Loads configuration from `~/.kestrel/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Two layers sit on top of the file:
//! - [`OrchestratorConfig`]: the fixed baseline every request starts from
//! - [`ConfigOverrides`]: optional per-request values, shallow-merged into a
//!   fresh copy of the baseline with [`OrchestratorConfig::merge`]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.kestrel/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Governed system prompt placed after the core instructions
    #[serde(default)]
    pub system_prompt: String,

    /// Safety limits for the tool loop
    #[serde(default)]
    pub tool_loop: LoopConfig,
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("system_prompt", &self.system_prompt)
            .field("tool_loop", &self.tool_loop)
            .finish()
    }
}

/// Safety bounds for one tool-loop run. Immutable once a loop starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum model invocations per request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum tool invocations per request, across all iterations
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,

    /// Per-call timeout for a single tool invocation
    #[serde(default = "default_tool_call_timeout_ms")]
    pub tool_call_timeout_ms: u64,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_max_tool_calls() -> usize {
    20
}
fn default_tool_call_timeout_ms() -> u64 {
    30_000
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_calls: default_max_tool_calls(),
            tool_call_timeout_ms: default_tool_call_timeout_ms(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.tool_call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tool_call_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Request-scoped engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub loop_config: LoopConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: Some(default_temperature()),
            max_tokens: Some(default_max_tokens()),
            loop_config: LoopConfig::default(),
        }
    }
}

/// Per-request overrides. Every field is optional; unset fields keep the
/// baseline value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    /// Shallow-merge `overrides` into a copy of this baseline.
    pub fn merge(&self, overrides: &ConfigOverrides) -> OrchestratorConfig {
        OrchestratorConfig {
            model: overrides.model.clone().unwrap_or_else(|| self.model.clone()),
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            loop_config: LoopConfig {
                max_iterations: overrides
                    .max_iterations
                    .unwrap_or(self.loop_config.max_iterations),
                max_tool_calls: overrides
                    .max_tool_calls
                    .unwrap_or(self.loop_config.max_tool_calls),
                tool_call_timeout_ms: overrides
                    .tool_call_timeout_ms
                    .unwrap_or(self.loop_config.tool_call_timeout_ms),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }
        if let Some(t) = self.temperature {
            validate_temperature(t)?;
        }
        self.loop_config.validate()
    }
}

fn validate_temperature(t: f32) -> Result<(), ConfigError> {
    if !(0.0..=2.0).contains(&t) {
        return Err(ConfigError::ValidationError(
            "temperature must be between 0.0 and 2.0".into(),
        ));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from the default path (~/.kestrel/config.toml).
    ///
    /// Environment variables override the file:
    /// - `KESTREL_API_KEY` (then `OPENROUTER_API_KEY`, `OPENAI_API_KEY`)
    /// - `KESTREL_API_URL`
    /// - `KESTREL_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides and re-validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("KESTREL_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(url) = lookup("KESTREL_API_URL") {
            self.api_url = url;
        }
        if let Some(model) = lookup("KESTREL_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kestrel")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_temperature(self.default_temperature)?;
        self.tool_loop.validate()
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The baseline every request starts from.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            model: self.default_model.clone(),
            temperature: Some(self.default_temperature),
            max_tokens: Some(self.default_max_tokens),
            loop_config: self.tool_loop,
        }
    }

    /// Render the configuration as TOML with the API key removed.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        shown.api_key = shown.api_key.map(|_| "[REDACTED]".into());
        toml::to_string_pretty(&shown).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            system_prompt: String::new(),
            tool_loop: LoopConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to render config: {0}")]
    SerializeError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
