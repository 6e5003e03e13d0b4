use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::{ConfigError, LlmConfig},
    error::LLMError,
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Chat-completions client for the OpenAI API and compatible servers such as
/// vLLM or LiteLLM.
#[derive(Debug, Clone)]
pub struct OpenAICompatible {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    name: &'static str,
}

impl OpenAICompatible {
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            name,
        })
    }

    /// The OpenAI API, or any compatible service reached through `base_url`.
    /// The key comes from the config, falling back to `OPENAI_API_KEY`.
    pub fn openai(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
            .ok_or(LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let base_url = config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);

        Ok(Self::new("openai", base_url, Some(api_key), DEFAULT_TIMEOUT)?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[async_trait]
impl LLMProvider for OpenAICompatible {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        debug!(
            provider = self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat completion"
        );

        let builder = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(&request);

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
                return Err(LLMError::Provider(envelope.error.message));
            }
            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
            finish_reason: choice.finish_reason,
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
