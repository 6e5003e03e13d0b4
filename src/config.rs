//! `mcprobe.yaml` loading and per-component LLM settings.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::AgentKind;
use crate::scenario::ScenarioLlmOverride;
use crate::LLMError;

/// Looked up in the working directory, first match wins.
pub const CONFIG_FILE_NAMES: &[&str] = &["mcprobe.yaml", ".mcprobe.yaml", "mcprobe.yml", ".mcprobe.yml"];

pub const DEFAULT_PROVIDER: &str = "ollama";
pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_RESULTS_DIR: &str = "test-results";
/// Smallest context window accepted for `context_size`.
pub const MIN_CONTEXT_SIZE: u32 = 1024;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}:-]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),

    #[error("unknown provider `{name}` (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Fully resolved settings for one LLM-backed component.
#[derive(Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Context window requested from providers that let the client pick one.
    pub context_size: Option<u32>,
    pub reasoning: Option<ReasoningLevel>,
    /// Appended to the component's system prompt.
    pub extra_instructions: Option<String>,
}

/// Thinking effort for models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    Low,
    Medium,
    High,
}

impl ReasoningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningLevel::Low => "low",
            ReasoningLevel::Medium => "medium",
            ReasoningLevel::High => "high",
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key: None,
            base_url: None,
            context_size: None,
            reasoning: None,
            extra_instructions: None,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("context_size", &self.context_size)
            .field("reasoning", &self.reasoning)
            .field("extra_instructions", &self.extra_instructions)
            .finish()
    }
}

impl LlmConfig {
    fn apply_section(&mut self, section: &LlmSection) {
        if let Some(provider) = &section.provider {
            self.provider = provider.clone();
        }
        if let Some(model) = &section.model {
            self.model = model.clone();
        }
        if let Some(temperature) = section.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = section.max_tokens {
            self.max_tokens = max_tokens;
        }
        if section.api_key.is_some() {
            self.api_key = section.api_key.clone();
        }
        if section.base_url.is_some() {
            self.base_url = section.base_url.clone();
        }
        if section.context_size.is_some() {
            self.context_size = section.context_size;
        }
        if section.reasoning.is_some() {
            self.reasoning = section.reasoning;
        }
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(provider) = &cli.provider {
            self.provider = provider.clone();
        }
        if let Some(model) = &cli.model {
            self.model = model.clone();
        }
        if let Some(temperature) = cli.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = cli.max_tokens {
            self.max_tokens = max_tokens;
        }
        if cli.base_url.is_some() {
            self.base_url = cli.base_url.clone();
        }
        if cli.api_key.is_some() {
            self.api_key = cli.api_key.clone();
        }
    }

    /// Layer a scenario's own `config.judge` / `config.synthetic_user` block on top.
    pub fn with_scenario_override(&self, scenario: Option<&ScenarioLlmOverride>) -> Self {
        let mut config = self.clone();
        if let Some(scenario) = scenario {
            if let Some(model) = &scenario.model {
                config.model = model.clone();
            }
            if let Some(temperature) = scenario.temperature {
                config.temperature = temperature;
            }
            if scenario.extra_instructions.is_some() {
                config.extra_instructions = scenario.extra_instructions.clone();
            }
        }
        config
    }
}

/// An LLM block as written in the config file; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_instructions: Option<String>,
}

impl LlmSection {
    fn validate(&self, section: &str) -> Result<(), String> {
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(format!(
                    "{section}.temperature must be between 0 and 2, got {temperature}"
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(format!("{section}.max_tokens must be at least 1"));
        }
        if let Some(size) = self.context_size {
            if size < MIN_CONTEXT_SIZE {
                return Err(format!(
                    "{section}.context_size must be at least {MIN_CONTEXT_SIZE}, got {size}"
                ));
            }
        }
        Ok(())
    }
}

/// Where the `tool` agent finds a live MCP server: a command to spawn over
/// stdio, or the URL of a streamable HTTP endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(rename = "type", default)]
    pub kind: AgentKind,
    /// YAML file of fixture-backed tools for the `tool` agent. Takes
    /// precedence over `mcp_server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_rounds: Option<usize>,
    #[serde(flatten)]
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Wall-clock limit for one whole scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSection {
    #[serde(default = "default_true")]
    pub save: bool,
    #[serde(default = "default_results_dir")]
    pub dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_results_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RESULTS_DIR)
}

impl Default for ResultsSection {
    fn default() -> Self {
        Self {
            save: true,
            dir: default_results_dir(),
        }
    }
}

/// Parsed `mcprobe.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<McpServerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<LlmSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_user: Option<LlmSection>,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub results: ResultsSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Agent,
    Judge,
    SyntheticUser,
}

/// LLM settings given on the command line; these beat everything in the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl FileConfig {
    /// Discover and load a config file. No file and no explicit path is not an error.
    pub fn load(explicit: Option<&Path>, dir: &Path) -> Result<Option<Self>, ConfigError> {
        match discover_config_file(explicit, dir)? {
            Some(path) => Self::from_path(&path).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content, path, &|name: &str| std::env::var(name).ok())
    }

    pub fn from_yaml_str(
        content: &str,
        path: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        };

        let raw: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|error| invalid(error.to_string()))?;
        if raw.is_null() {
            return Ok(Self::default());
        }

        let interpolated = interpolate_env_vars(raw, env)?;
        let config: Self =
            serde_yaml::from_value(interpolated).map_err(|error| invalid(error.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        let sections = [
            ("llm", self.llm.as_ref()),
            ("agent", Some(&self.agent.llm)),
            ("judge", self.judge.as_ref()),
            ("synthetic_user", self.synthetic_user.as_ref()),
        ];
        for (name, section) in sections {
            if let Some(section) = section {
                section.validate(name)?;
            }
        }
        if let Some(server) = &self.mcp_server {
            if server.command.is_some() == server.url.is_some() {
                return Err("mcp_server needs exactly one of `command` or `url`".to_string());
            }
        }
        Ok(())
    }

    /// Priority, highest first: CLI, component section, shared `llm:` section, defaults.
    pub fn resolve_llm(&self, component: Component, cli: &CliOverrides) -> LlmConfig {
        let mut config = LlmConfig::default();

        if let Some(shared) = &self.llm {
            config.apply_section(shared);
        }

        let section = match component {
            Component::Agent => Some(&self.agent.llm),
            Component::Judge => self.judge.as_ref(),
            Component::SyntheticUser => self.synthetic_user.as_ref(),
        };
        if let Some(section) = section {
            config.apply_section(section);
            config.extra_instructions = section.extra_instructions.clone();
        }

        config.apply_cli(cli);
        config
    }
}

pub fn discover_config_file(explicit: Option<&Path>, dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    Ok(CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists()))
}

/// Replace `${VAR}` and `${VAR:-default}` in every string of the document.
/// A `${VAR}` with nothing set and no default is an error. A string that is
/// exactly one placeholder and resolves to a number or bool keeps that type.
pub fn interpolate_env_vars(
    value: serde_yaml::Value,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<serde_yaml::Value, ConfigError> {
    use serde_yaml::Value;

    match value {
        Value::String(text) => {
            let replaced = interpolate_str(&text, env)?;
            Ok(retype_placeholder(&text, replaced))
        }
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| interpolate_env_vars(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, interpolate_env_vars(item, env)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other),
    }
}

fn retype_placeholder(original: &str, replaced: String) -> serde_yaml::Value {
    use serde_yaml::Value;

    let whole = ENV_VAR
        .find(original)
        .is_some_and(|found| found.start() == 0 && found.end() == original.len());
    if whole {
        if let Ok(scalar @ (Value::Number(_) | Value::Bool(_))) =
            serde_yaml::from_str::<Value>(&replaced)
        {
            return scalar;
        }
    }
    Value::String(replaced)
}

fn interpolate_str(text: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut missing = None;
    let replaced = ENV_VAR.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        if let Some(value) = env(name) {
            return value;
        }
        if let Some(default) = caps.get(2) {
            return default.as_str().to_string();
        }
        missing.get_or_insert_with(|| name.to_string());
        String::new()
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(replaced.into_owned()),
    }
}
