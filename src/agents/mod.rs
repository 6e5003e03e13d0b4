//! The system under test, seen from the orchestrator's side.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{AgentSection, ConfigError, LlmConfig, McpServerSection};
use crate::conversation::AgentReply;
use crate::mcp::{load_mcp_tools, McpError};
use crate::providers::{create_provider, LLMProvider};
use crate::tools::ToolDefinition;
use crate::types::{ChatMessage, CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod fixtures;
pub mod simple;
pub mod tool;

pub use fixtures::{load_fixture_tools, FixtureTool};
pub use simple::SimpleAgent;
pub use tool::ToolAgent;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failed to generate a response: {0}")]
    Provider(#[from] LLMError),

    #[error("failed to load tools from {path}: {message}")]
    Tools { path: String, message: String },

    #[error("tool `{tool}` has an invalid parameter schema: {message}")]
    InvalidToolSchema { tool: String, message: String },

    #[error("agent type `tool` needs `agent.tools` pointing at a tool fixture file, or an `mcp_server`")]
    MissingTools,

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// An agent being exercised by a scenario.
///
/// Implementations own their conversation history; the orchestrator only
/// talks to them through these methods.
#[async_trait]
pub trait AgentUnderTest: Send {
    fn name(&self) -> &str;

    fn model(&self) -> Option<&str> {
        None
    }

    fn system_prompt(&self) -> Option<&str> {
        None
    }

    fn available_tools(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    /// Forget everything said so far. Safe to call before the first message.
    async fn reset(&mut self);

    async fn send_message(&mut self, message: &str) -> Result<AgentReply, AgentError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Simple,
    Tool,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Simple => "simple",
            AgentKind::Tool => "tool",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(AgentKind::Simple),
            "tool" => Ok(AgentKind::Tool),
            other => Err(format!("unknown agent type `{other}` (expected simple or tool)")),
        }
    }
}

/// Model settings shared by the built-in agents.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl ChatSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        }
    }

    pub fn from_llm_config(config: &LlmConfig, system_prompt: Option<String>) -> Self {
        Self {
            model: config.model.clone(),
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
            system_prompt,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// History a fresh conversation starts from.
    pub(crate) fn initial_history(&self) -> Vec<ChatMessage> {
        self.system_prompt
            .iter()
            .filter(|prompt| !prompt.trim().is_empty())
            .map(|prompt| ChatMessage::system(prompt.clone()))
            .collect()
    }

    pub(crate) fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// A reply that ends in a question is still waiting on the user.
pub(crate) fn looks_complete(text: &str) -> bool {
    !text.trim_end().ends_with('?')
}

pub(crate) fn response_metadata(response: &CompletionResponse) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(usage) = response.usage {
        metadata.insert(
            "usage".to_string(),
            serde_json::to_value(usage).unwrap_or(Value::Null),
        );
    }
    if let Some(reason) = &response.finish_reason {
        metadata.insert("finish_reason".to_string(), Value::String(reason.clone()));
    }
    metadata
}

/// Build the agent selected by the config file's `agent:` section.
///
/// The `tool` agent takes its tools from the `agent.tools` fixture file when
/// one is given, otherwise from the MCP server. Relative fixture paths are
/// resolved against `base_dir`.
pub async fn from_config(
    section: &AgentSection,
    mcp_server: Option<&McpServerSection>,
    llm: &LlmConfig,
    base_dir: &Path,
) -> Result<Box<dyn AgentUnderTest>, AgentError> {
    let provider: Arc<dyn LLMProvider> = create_provider(llm)?;
    let settings = ChatSettings::from_llm_config(llm, section.system_prompt.clone());

    match section.kind {
        AgentKind::Simple => Ok(Box::new(SimpleAgent::new(provider, settings))),
        AgentKind::Tool => {
            let registry = match (&section.tools, mcp_server) {
                (Some(path), _) => {
                    let path = if path.is_relative() {
                        base_dir.join(path)
                    } else {
                        path.clone()
                    };
                    load_fixture_tools(&path)?
                }
                (None, Some(server)) => load_mcp_tools(server).await?,
                (None, None) => return Err(AgentError::MissingTools),
            };
            let mut agent = ToolAgent::new(provider, settings, registry)?;
            if let Some(rounds) = section.max_tool_rounds {
                agent = agent.with_max_rounds(rounds);
            }
            Ok(Box::new(agent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_parses_case_insensitively() {
        assert_eq!("Tool".parse::<AgentKind>().unwrap(), AgentKind::Tool);
        assert_eq!("simple".parse::<AgentKind>().unwrap(), AgentKind::Simple);
        assert!("adk".parse::<AgentKind>().is_err());
    }

    #[test]
    fn completeness_heuristic_checks_trailing_question_mark() {
        assert!(looks_complete("It is 12°C in Oslo."));
        assert!(!looks_complete("Which city do you mean?  "));
    }

    #[test]
    fn blank_system_prompt_is_dropped() {
        let settings = ChatSettings::new("m").with_system_prompt("  ");
        assert!(settings.initial_history().is_empty());
        let settings = ChatSettings::new("m").with_system_prompt("Be helpful.");
        assert_eq!(settings.initial_history().len(), 1);
    }

    #[tokio::test]
    async fn tool_agent_without_any_tool_source_is_rejected() {
        let section = AgentSection {
            kind: AgentKind::Tool,
            ..AgentSection::default()
        };
        let err = from_config(&section, None, &LlmConfig::default(), Path::new("."))
            .await
            .err();
        assert!(matches!(err, Some(AgentError::MissingTools)));
    }

    #[tokio::test]
    async fn tool_agent_reports_a_bad_mcp_server_section() {
        let section = AgentSection {
            kind: AgentKind::Tool,
            ..AgentSection::default()
        };
        let server = McpServerSection::default();
        let err = from_config(&section, Some(&server), &LlmConfig::default(), Path::new("."))
            .await
            .err();
        assert!(matches!(err, Some(AgentError::Mcp(McpError::NoTransport))));
    }

    #[tokio::test]
    async fn fixture_file_wins_over_mcp_server() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tools.yaml"),
            "tools:\n  - name: ping\n    default: { kind: ok, value: pong }\n",
        )
        .unwrap();
        let section = AgentSection {
            kind: AgentKind::Tool,
            tools: Some("tools.yaml".into()),
            ..AgentSection::default()
        };
        let server = McpServerSection {
            command: Some("does-not-exist-mcp".to_string()),
            url: None,
        };
        let agent = from_config(&section, Some(&server), &LlmConfig::default(), dir.path())
            .await
            .unwrap();
        assert_eq!(agent.available_tools().len(), 1);
        assert_eq!(agent.available_tools()[0].name, "ping");
    }
}
