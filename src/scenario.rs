//! Declarative test scenarios and their YAML loader.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const MAX_TURNS_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("invalid scenario in {source_name}: {message}")]
    Validation { source_name: String, message: String },
}

impl ScenarioError {
    fn parse(source_name: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }

    fn validation(source_name: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatienceLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl PatienceLevel {
    /// How many clarifying questions the user tolerates before getting frustrated.
    pub fn question_threshold(self) -> u32 {
        match self {
            PatienceLevel::Low => 1,
            PatienceLevel::Medium => 3,
            PatienceLevel::High => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbosityLevel {
    #[default]
    Concise,
    Medium,
    Verbose,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpertiseLevel {
    #[default]
    Novice,
    Intermediate,
    Expert,
}

macro_rules! lowercase_display {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = format!("{self:?}").to_lowercase();
                f.write_str(&text)
            }
        }
    )*};
}

lowercase_display!(PatienceLevel, VerbosityLevel, ExpertiseLevel);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraits {
    #[serde(default)]
    pub patience: PatienceLevel,
    #[serde(default)]
    pub verbosity: VerbosityLevel,
    #[serde(default)]
    pub expertise: ExpertiseLevel,
}

/// What the simulated user knows, what it doesn't, and how it behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationBehavior {
    #[serde(default)]
    pub known_facts: Vec<String>,
    #[serde(default)]
    pub unknown_facts: Vec<String>,
    #[serde(default)]
    pub traits: UserTraits,
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticUserConfig {
    pub persona: String,
    pub initial_query: String,
    #[serde(default)]
    pub clarification_behavior: ClarificationBehavior,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallCriterion {
    pub tool: String,
    #[serde(default)]
    pub assertions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageConfig {
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub optional_tools: Vec<String>,
    #[serde(default)]
    pub prohibited_tools: Vec<String>,
    #[serde(default)]
    pub tool_call_criteria: Vec<ToolCallCriterion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfficiencyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_llm_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conversation_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub correctness_criteria: Vec<String>,
    #[serde(default)]
    pub failure_criteria: Vec<String>,
    #[serde(default)]
    pub tool_usage: ToolUsageConfig,
    #[serde(default)]
    pub efficiency: EfficiencyConfig,
}

/// Per-scenario LLM settings; unset fields fall back to the global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioLlmOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<ScenarioLlmOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_user: Option<ScenarioLlmOverride>,
}

/// `skip: true` or `skip: "reason"` in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Skip {
    Flag(bool),
    Reason(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<Skip>,
    pub synthetic_user: SyntheticUserConfig,
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ScenarioConfig>,
}

impl TestScenario {
    pub fn max_turns(&self) -> u32 {
        self.synthetic_user.max_turns
    }

    pub fn is_skipped(&self) -> bool {
        match &self.skip {
            Some(Skip::Flag(flag)) => *flag,
            Some(Skip::Reason(_)) => true,
            None => false,
        }
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match &self.skip {
            Some(Skip::Reason(reason)) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn judge_override(&self) -> Option<&ScenarioLlmOverride> {
        self.config.as_ref().and_then(|config| config.judge.as_ref())
    }

    pub fn synthetic_user_override(&self) -> Option<&ScenarioLlmOverride> {
        self.config
            .as_ref()
            .and_then(|config| config.synthetic_user.as_ref())
    }

    /// Normalise and check the fields serde cannot express. Name and
    /// description come back trimmed.
    pub fn validate(mut self) -> Result<Self, String> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err("scenario name cannot be empty or whitespace".to_string());
        }
        self.description = self.description.trim().to_string();
        if self.description.is_empty() {
            return Err("scenario description cannot be empty or whitespace".to_string());
        }

        let user = &self.synthetic_user;
        if user.persona.trim().is_empty() {
            return Err("synthetic_user.persona cannot be empty".to_string());
        }
        if user.initial_query.trim().is_empty() {
            return Err("synthetic_user.initial_query cannot be empty".to_string());
        }
        if !(1..=MAX_TURNS_LIMIT).contains(&user.max_turns) {
            return Err(format!(
                "synthetic_user.max_turns must be between 1 and {MAX_TURNS_LIMIT}, got {}",
                user.max_turns
            ));
        }

        if self.evaluation.correctness_criteria.is_empty() {
            return Err("evaluation.correctness_criteria needs at least one criterion".to_string());
        }
        if let Some(criterion) = self
            .evaluation
            .tool_usage
            .tool_call_criteria
            .iter()
            .find(|criterion| criterion.tool.trim().is_empty())
        {
            return Err(format!(
                "tool_call_criteria entry with assertions {:?} has no tool name",
                criterion.assertions
            ));
        }

        Ok(self)
    }
}

/// A parsed scenario together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedScenario {
    pub path: PathBuf,
    pub scenario: TestScenario,
}

pub struct ScenarioParser;

impl ScenarioParser {
    pub fn parse_file(path: impl AsRef<Path>) -> Result<TestScenario, ScenarioError> {
        let path = path.as_ref();
        let source_name = path.display().to_string();

        if !path.exists() {
            return Err(ScenarioError::parse(&source_name, "file not found"));
        }
        if !path.is_file() {
            return Err(ScenarioError::parse(&source_name, "path is not a file"));
        }

        let content = fs::read_to_string(path)
            .map_err(|error| ScenarioError::parse(&source_name, error.to_string()))?;
        Self::parse_str(&content, &source_name)
    }

    pub fn parse_str(content: &str, source_name: &str) -> Result<TestScenario, ScenarioError> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|error| ScenarioError::parse(source_name, format!("invalid YAML: {error}")))?;

        match value {
            serde_yaml::Value::Null => {
                return Err(ScenarioError::parse(source_name, "empty scenario file"))
            }
            serde_yaml::Value::Mapping(_) => {}
            _ => {
                return Err(ScenarioError::parse(
                    source_name,
                    "scenario must be a YAML mapping",
                ))
            }
        }

        let scenario: TestScenario = serde_yaml::from_value(value)
            .map_err(|error| ScenarioError::validation(source_name, error.to_string()))?;
        scenario
            .validate()
            .map_err(|message| ScenarioError::validation(source_name, message))
    }

    /// Scenario files under `dir`, recursively. `.yaml` files come first, then
    /// `.yml` files that have no `.yaml` twin; each group is sorted by path.
    pub fn discover_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ScenarioError> {
        let dir = dir.as_ref();
        let source_name = dir.display().to_string();
        if !dir.exists() {
            return Err(ScenarioError::parse(&source_name, "directory not found"));
        }
        if !dir.is_dir() {
            return Err(ScenarioError::parse(&source_name, "path is not a directory"));
        }

        let mut files = Vec::new();
        collect_files(dir, &mut files)
            .map_err(|error| ScenarioError::parse(&source_name, error.to_string()))?;
        files.sort();

        let yaml = files.iter().filter(|path| has_extension(path, "yaml"));
        let yml = files
            .iter()
            .filter(|path| has_extension(path, "yml"))
            .filter(|path| !path.with_extension("yaml").exists());
        Ok(yaml.chain(yml).cloned().collect())
    }

    /// Every scenario under `dir`. Stops at the first file that fails to parse.
    pub fn parse_directory(dir: impl AsRef<Path>) -> Result<Vec<LoadedScenario>, ScenarioError> {
        Self::discover_files(dir)?
            .into_iter()
            .map(|path| {
                let scenario = Self::parse_file(&path)?;
                Ok(LoadedScenario { path, scenario })
            })
            .collect()
    }

    /// A single file, or every scenario in a directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<LoadedScenario>, ScenarioError> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::parse_directory(path)
        } else {
            Ok(vec![LoadedScenario {
                path: path.to_path_buf(),
                scenario: Self::parse_file(path)?,
            }])
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(extension)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
