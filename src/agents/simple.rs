use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::agents::{looks_complete, response_metadata, AgentError, AgentUnderTest, ChatSettings};
use crate::conversation::AgentReply;
use crate::providers::LLMProvider;
use crate::types::ChatMessage;

/// Plain chat against one model, no tools.
pub struct SimpleAgent {
    name: String,
    provider: Arc<dyn LLMProvider>,
    settings: ChatSettings,
    history: Vec<ChatMessage>,
}

impl SimpleAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: ChatSettings) -> Self {
        let history = settings.initial_history();
        Self {
            name: "SimpleAgent".to_string(),
            provider,
            settings,
            history,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }
}

#[async_trait]
impl AgentUnderTest for SimpleAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&str> {
        Some(self.settings.model.as_str())
    }

    fn system_prompt(&self) -> Option<&str> {
        self.settings.system_prompt.as_deref()
    }

    async fn reset(&mut self) {
        self.history = self.settings.initial_history();
    }

    async fn send_message(&mut self, message: &str) -> Result<AgentReply, AgentError> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(message));

        let response = self.provider.complete(self.settings.request(messages)).await?;
        let text = response.message.text().to_string();
        debug!(agent = %self.name, chars = text.len(), "agent replied");

        self.history.push(ChatMessage::user(message));
        self.history.push(ChatMessage::assistant(text.clone()));

        Ok(AgentReply {
            is_complete: looks_complete(&text),
            metadata: response_metadata(&response),
            message: text,
            tool_calls: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::types::{MessageRole, TokenUsage};

    #[tokio::test]
    async fn keeps_history_and_flags_questions() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_reply("Which city?")
                .then_reply_with_usage("Oslo is 12°C.", TokenUsage::new(10, 4)),
        );
        let settings = ChatSettings::new("test-model").with_system_prompt("Be brief.");
        let mut agent = SimpleAgent::new(provider.clone(), settings);

        let first = agent.send_message("Weather?").await.unwrap();
        assert!(!first.is_complete);
        assert!(first.tool_calls.is_empty());

        let second = agent.send_message("Oslo").await.unwrap();
        assert!(second.is_complete);
        assert!(second.metadata.contains_key("usage"));

        let requests = provider.requests();
        let last = &requests[1].messages;
        assert_eq!(last[0].role, MessageRole::System);
        assert_eq!(last.len(), 4);
        assert_eq!(agent.history().len(), 5);
    }

    #[tokio::test]
    async fn reset_keeps_only_the_system_prompt() {
        let provider = Arc::new(ScriptedProvider::from_replies(["hi"]));
        let settings = ChatSettings::new("m").with_system_prompt("sys");
        let mut agent = SimpleAgent::new(provider, settings);

        agent.send_message("hello").await.unwrap();
        agent.reset().await;
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].text(), "sys");
    }

    #[tokio::test]
    async fn provider_failure_is_an_agent_error() {
        let provider = Arc::new(ScriptedProvider::new().then_error("boom"));
        let mut agent = SimpleAgent::new(provider, ChatSettings::new("m"));
        let err = agent.send_message("hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn failed_send_leaves_history_untouched() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_reply("Hi there.")
                .then_error("boom"),
        );
        let settings = ChatSettings::new("m").with_system_prompt("sys");
        let mut agent = SimpleAgent::new(provider, settings);

        agent.send_message("hello").await.unwrap();
        assert_eq!(agent.history().len(), 3);

        assert!(agent.send_message("still there?").await.is_err());
        assert_eq!(agent.history().len(), 3);
        assert_eq!(agent.history()[2].text(), "Hi there.");
    }
}
