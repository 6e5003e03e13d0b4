use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::agents::{looks_complete, response_metadata, AgentError, AgentUnderTest, ChatSettings};
use crate::conversation::{AgentReply, ToolInvocation};
use crate::providers::LLMProvider;
use crate::tools::{ToolCall, ToolDefinition, ToolRegistry};
use crate::types::ChatMessage;

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Chat agent that may call tools from a [`ToolRegistry`] before answering.
///
/// Each user message runs completion rounds until the model answers without
/// requesting tools or the round limit is hit. Every requested call is
/// recorded, including ones rejected for bad arguments.
pub struct ToolAgent {
    name: String,
    provider: Arc<dyn LLMProvider>,
    settings: ChatSettings,
    registry: ToolRegistry,
    validators: HashMap<String, JSONSchema>,
    max_rounds: usize,
    history: Vec<ChatMessage>,
    call_counter: usize,
}

impl fmt::Debug for ToolAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolAgent")
            .field("name", &self.name)
            .field("model", &self.settings.model)
            .field("registry", &self.registry)
            .field("max_rounds", &self.max_rounds)
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl ToolAgent {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        settings: ChatSettings,
        registry: ToolRegistry,
    ) -> Result<Self, AgentError> {
        let validators = build_schema_validators(&registry)?;
        let history = settings.initial_history();
        Ok(Self {
            name: "ToolAgent".to_string(),
            provider,
            settings,
            registry,
            validators,
            max_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            history,
            call_counter: 0,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    async fn execute(&self, call: &ToolCall) -> (ToolInvocation, String) {
        let name = call.name().to_string();
        let started = Instant::now();

        let arguments = match call.arguments() {
            Ok(arguments) => arguments,
            Err(error) => {
                let invocation =
                    ToolInvocation::failed(&name, Map::new(), error.to_string(), started.elapsed());
                return (invocation, error_content(&error.to_string()));
            }
        };
        let value = Value::Object(arguments.clone());

        if let Err(errors) = self.validate(&name, &value) {
            let message = format!("invalid arguments: {}", errors.join("; "));
            let content = error_content(&message);
            return (
                ToolInvocation::failed(&name, arguments, message, started.elapsed()),
                content,
            );
        }

        match self.registry.invoke(&name, &value).await {
            Ok(result) => {
                let content = result.to_string();
                (
                    ToolInvocation::succeeded(&name, arguments, result, started.elapsed()),
                    content,
                )
            }
            Err(error) => {
                warn!(tool = %name, error = %error, "tool call failed");
                let content = error_content(&error.to_string());
                (
                    ToolInvocation::failed(&name, arguments, error.to_string(), started.elapsed()),
                    content,
                )
            }
        }
    }

    async fn run_rounds(&mut self) -> Result<AgentReply, AgentError> {
        let mut invocations = Vec::new();
        let mut final_text = String::new();
        let mut metadata = Map::new();
        let mut pending_tools = false;

        for round in 0..self.max_rounds {
            let request = self
                .settings
                .request(self.history.clone())
                .with_tool_registry(&self.registry);
            let response = self.provider.complete(request).await?;
            metadata = response_metadata(&response);

            let mut assistant = response.message;
            for call in assistant.tool_calls.iter_mut() {
                if call.id.is_none() {
                    call.id = Some(self.next_call_id());
                }
            }
            final_text = assistant.text().to_string();
            let calls = assistant.tool_calls.clone();
            self.history.push(assistant);

            pending_tools = !calls.is_empty();
            if !pending_tools {
                break;
            }

            debug!(agent = %self.name, round, calls = calls.len(), "executing tool calls");
            for call in calls {
                let (invocation, content) = self.execute(&call).await;
                let id = call.id.clone().unwrap_or_default();
                self.history.push(ChatMessage::tool(id, content));
                invocations.push(invocation);
            }
        }

        if pending_tools {
            warn!(agent = %self.name, rounds = self.max_rounds, "tool loop hit the round limit");
        }
        metadata.insert("tool_rounds_exhausted".to_string(), Value::Bool(pending_tools));

        Ok(AgentReply {
            is_complete: !pending_tools && looks_complete(&final_text),
            message: final_text,
            tool_calls: invocations,
            metadata,
        })
    }

    fn validate(&self, tool: &str, arguments: &Value) -> Result<(), Vec<String>> {
        let Some(schema) = self.validators.get(tool) else {
            // Unknown tools are reported by the registry.
            return Ok(());
        };
        schema
            .validate(arguments)
            .map_err(|errors| errors.map(|error| error.to_string()).collect())
    }

    fn next_call_id(&mut self) -> String {
        self.call_counter += 1;
        format!("call_{}", self.call_counter)
    }
}

fn error_content(message: &str) -> String {
    json!({ "error": message }).to_string()
}

fn build_schema_validators(
    registry: &ToolRegistry,
) -> Result<HashMap<String, JSONSchema>, AgentError> {
    let mut validators = HashMap::new();
    for definition in registry.definitions() {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&definition.parameters)
            .map_err(|error| AgentError::InvalidToolSchema {
                tool: definition.name.clone(),
                message: error.to_string(),
            })?;
        validators.insert(definition.name, compiled);
    }
    Ok(validators)
}

#[async_trait]
impl AgentUnderTest for ToolAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&str> {
        Some(self.settings.model.as_str())
    }

    fn system_prompt(&self) -> Option<&str> {
        self.settings.system_prompt.as_deref()
    }

    fn available_tools(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    async fn reset(&mut self) {
        self.history = self.settings.initial_history();
        self.call_counter = 0;
    }

    async fn send_message(&mut self, message: &str) -> Result<AgentReply, AgentError> {
        let checkpoint = self.history.len();
        self.history.push(ChatMessage::user(message));

        let reply = self.run_rounds().await;
        if reply.is_err() {
            self.history.truncate(checkpoint);
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::agents::fixtures::parse_fixture_tools;
    use crate::providers::scripted::ScriptedProvider;
    use crate::types::MessageRole;

    const TOOLS: &str = r#"
tools:
  - name: get_weather
    parameters:
      type: object
      properties:
        city: { type: string }
      required: [city]
    fixtures:
      - when: { city: Oslo }
        then: { kind: ok, value: { temp_c: 12 } }
    default: { kind: err, message: unknown city }
"#;

    fn agent(provider: Arc<ScriptedProvider>) -> ToolAgent {
        let registry = parse_fixture_tools(TOOLS).unwrap();
        ToolAgent::new(provider, ChatSettings::new("m"), registry).unwrap()
    }

    #[tokio::test]
    async fn records_tool_results_and_errors() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(vec![
                    ToolCall::new("get_weather", json!({"city": "Oslo"})),
                    ToolCall::new("get_weather", json!({"city": "Atlantis"})),
                ])
                .then_reply("Oslo is 12°C; I couldn't find Atlantis."),
        );
        let mut agent = agent(provider.clone());

        let reply = agent.send_message("Weather in Oslo and Atlantis").await.unwrap();
        assert!(reply.is_complete);
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].result(), Some(&json!({"temp_c": 12})));
        assert!(reply.tool_calls[1].error().unwrap().contains("unknown city"));

        let second_request = &provider.requests()[1];
        let tool_messages: Vec<_> = second_request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(!second_request.tools.is_empty());
    }

    #[tokio::test]
    async fn schema_violations_are_recorded_without_invoking() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(vec![ToolCall::new("get_weather", json!({"town": "Oslo"}))])
                .then_reply("Sorry."),
        );
        let mut agent = agent(provider);

        let reply = agent.send_message("Weather?").await.unwrap();
        let call = &reply.tool_calls[0];
        assert!(call.error().unwrap().starts_with("invalid arguments"));
        assert_eq!(call.parameters().get("town"), Some(&json!("Oslo")));
    }

    #[tokio::test]
    async fn round_limit_leaves_reply_incomplete() {
        let call = || vec![ToolCall::new("get_weather", json!({"city": "Oslo"}))];
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(call())
                .then_tool_calls(call()),
        );
        let mut agent = agent(provider).with_max_rounds(2);

        let reply = agent.send_message("Weather?").await.unwrap();
        assert!(!reply.is_complete);
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.metadata["tool_rounds_exhausted"], json!(true));
    }

    #[tokio::test]
    async fn provider_failure_mid_tool_loop_rolls_back_the_turn() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_reply("Hello.")
                .then_tool_calls(vec![ToolCall::new("get_weather", json!({"city": "Oslo"}))])
                .then_error("connection reset"),
        );
        let mut agent = agent(provider);

        agent.send_message("hi").await.unwrap();
        let before: Vec<String> = agent.history().iter().map(|m| m.text().to_string()).collect();

        let err = agent.send_message("Weather in Oslo?").await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        let after: Vec<String> = agent.history().iter().map(|m| m.text().to_string()).collect();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn reset_clears_history_and_call_ids() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(vec![ToolCall::new("get_weather", json!({"city": "Oslo"}))])
                .then_reply("12°C"),
        );
        let mut agent = agent(provider);
        agent.send_message("Weather?").await.unwrap();
        assert!(agent.history().len() > 1);

        agent.reset().await;
        assert!(agent.history().is_empty());
        assert_eq!(agent.next_call_id(), "call_1");
        assert_eq!(agent.available_tools().len(), 1);
    }
}
