use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    config::{ConfigError, LlmConfig, ReasoningLevel, DEFAULT_MAX_TOKENS},
    error::LLMError,
    providers::LLMProvider,
    tools::Tool,
    types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage},
};

const OLLAMA_HOST: &str = "http://localhost:11434";
/// Ollama's own default window is 2048 tokens, too small for judge prompts.
pub const DEFAULT_CONTEXT_SIZE: u32 = 65_536;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for Ollama's native `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct Ollama {
    client: Client,
    host: String,
    context_size: u32,
    reasoning: Option<ReasoningLevel>,
}

impl Ollama {
    pub fn new(host: impl Into<String>, request_timeout: Duration) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            host: host.into(),
            context_size: DEFAULT_CONTEXT_SIZE,
            reasoning: None,
        })
    }

    /// The host comes from `base_url`, then `OLLAMA_HOST`, then localhost.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let host = config
            .base_url
            .clone()
            .or_else(|| env::var("OLLAMA_HOST").ok())
            .map(|host| normalize_host(&host))
            .unwrap_or_else(|| OLLAMA_HOST.to_string());

        let mut provider = Self::new(host, DEFAULT_TIMEOUT)?;
        if let Some(size) = config.context_size {
            provider.context_size = size;
        }
        provider.reasoning = config.reasoning;
        Ok(provider)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn chat_request<'a>(&self, request: &'a CompletionRequest) -> Result<ChatRequest<'a>, LLMError> {
        let messages = request
            .messages
            .iter()
            .map(OllamaMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut options = Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens.filter(|&n| n != DEFAULT_MAX_TOKENS) {
            options.insert("num_predict".to_string(), Value::from(max_tokens));
        }
        options.insert("num_ctx".to_string(), Value::from(self.context_size));

        Ok(ChatRequest {
            model: &request.model,
            messages,
            tools: &request.tools,
            format: request.response_format.as_ref().and_then(format_from_response_format),
            options,
            think: self.reasoning.map(|level| level.as_str()),
            stream: false,
        })
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    let host = host.strip_suffix("/v1").unwrap_or(host);
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// `json_schema` response formats become the bare schema, `json_object` becomes `"json"`.
fn format_from_response_format(format: &Value) -> Option<Value> {
    match format.get("type").and_then(Value::as_str) {
        Some("json_schema") => format.pointer("/json_schema/schema").cloned(),
        Some("json_object") => Some(Value::String("json".to_string())),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "<[Tool]>::is_empty")]
    tools: &'a [Tool],
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    options: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<&'static str>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: MessageRole,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

/// Ollama wants arguments as an object, not as encoded JSON text.
#[derive(Debug, Serialize)]
struct OllamaFunction {
    name: String,
    arguments: Map<String, Value>,
}

impl TryFrom<&ChatMessage> for OllamaMessage {
    type Error = LLMError;

    fn try_from(message: &ChatMessage) -> Result<Self, Self::Error> {
        let tool_calls = message
            .tool_calls
            .iter()
            .map(|call| {
                Ok(OllamaToolCall {
                    function: OllamaFunction {
                        name: call.name().to_string(),
                        arguments: call.arguments()?,
                    },
                })
            })
            .collect::<Result<Vec<_>, LLMError>>()?;

        Ok(Self {
            role: message.role,
            content: message.text().to_string(),
            tool_calls,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[async_trait]
impl LLMProvider for Ollama {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = self.chat_request(&request)?;
        debug!(
            provider = "ollama",
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            num_ctx = self.context_size,
            "sending chat request"
        );

        let url = format!("{}/api/chat", self.host);
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            if message.to_ascii_lowercase().contains("not found") {
                return Err(LLMError::Provider(format!(
                    "Ollama model `{}` not found; check `ollama list` on the server ({message})",
                    request.model
                )));
            }
            return Err(LLMError::Provider(format!("Ollama returned {status}: {message}")));
        }

        let parsed: ChatResponse = response.json().await?;
        let usage = TokenUsage::new(
            parsed.prompt_eval_count.unwrap_or(0),
            parsed.eval_count.unwrap_or(0),
        );

        Ok(CompletionResponse {
            message: parsed.message,
            usage: Some(usage),
            finish_reason: Some(parsed.done_reason.unwrap_or_else(|| "stop".to_string())),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::{ToolCall, ToolDefinition};

    fn provider(config: &LlmConfig) -> Ollama {
        Ollama::from_config(config).unwrap()
    }

    #[test]
    fn request_carries_context_size_and_reasoning() {
        let mut config = LlmConfig::default();
        config.base_url = Some("http://gpu-box:11434/v1/".to_string());
        config.context_size = Some(32_768);
        config.reasoning = Some(ReasoningLevel::Medium);
        let ollama = provider(&config);
        assert_eq!(ollama.host(), "http://gpu-box:11434");

        let request = CompletionRequest::new("gpt-oss", vec![ChatMessage::user("hi")])
            .with_temperature(0.3)
            .with_max_tokens(DEFAULT_MAX_TOKENS);
        let body = serde_json::to_value(ollama.chat_request(&request).unwrap()).unwrap();

        assert_eq!(body["model"], "gpt-oss");
        assert_eq!(body["stream"], false);
        assert_eq!(body["think"], "medium");
        assert_eq!(body["options"]["num_ctx"], 32_768);
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert!(body["options"].get("num_predict").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("format").is_none());
    }

    #[test]
    fn default_context_size_is_applied_without_reasoning() {
        let mut config = LlmConfig::default();
        config.base_url = Some("127.0.0.1:11434".to_string());
        let ollama = provider(&config);
        assert_eq!(ollama.host(), "http://127.0.0.1:11434");

        let request = CompletionRequest::new("llama3.2", vec![ChatMessage::user("hi")]).with_max_tokens(256);
        let body = serde_json::to_value(ollama.chat_request(&request).unwrap()).unwrap();
        assert_eq!(body["options"]["num_ctx"], DEFAULT_CONTEXT_SIZE);
        assert_eq!(body["options"]["num_predict"], 256);
        assert!(body.get("think").is_none());
    }

    #[test]
    fn tool_calls_are_sent_with_object_arguments() {
        let ollama = provider(&LlmConfig::default());
        let assistant = ChatMessage::assistant("")
            .with_tool_calls(vec![ToolCall::new("get_weather", json!({"city": "Oslo"})).with_id("call_1")]);
        let mut request = CompletionRequest::new(
            "llama3.2",
            vec![ChatMessage::user("weather?"), assistant, ChatMessage::tool("call_1", "{\"temp_c\":12}")],
        );
        request.tools.push(ToolDefinition::new("get_weather").into());

        let body = serde_json::to_value(ollama.chat_request(&request).unwrap()).unwrap();
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"]["city"], "Oslo");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn json_schema_response_format_becomes_format() {
        let ollama = provider(&LlmConfig::default());
        let schema = json!({ "type": "object", "properties": { "met": { "type": "boolean" } } });
        let request = CompletionRequest::new("llama3.2", vec![ChatMessage::user("judge")])
            .with_response_format(json!({
                "type": "json_schema",
                "json_schema": { "name": "CriteriaCheck", "schema": schema.clone() }
            }));
        let body = serde_json::to_value(ollama.chat_request(&request).unwrap()).unwrap();
        assert_eq!(body["format"], schema);

        assert_eq!(
            format_from_response_format(&json!({ "type": "json_object" })),
            Some(json!("json"))
        );
    }

    #[test]
    fn parses_native_response_with_tool_calls() {
        let parsed: ChatResponse = serde_json::from_value(json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{ "function": { "name": "get_weather", "arguments": { "city": "Oslo" } } }]
            },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 40,
            "eval_count": 9
        }))
        .unwrap();

        assert_eq!(parsed.message.tool_calls[0].name(), "get_weather");
        assert_eq!(parsed.message.tool_calls[0].arguments().unwrap()["city"], "Oslo");
        assert_eq!(parsed.prompt_eval_count, Some(40));
        assert_eq!(parsed.eval_count, Some(9));
    }
}
