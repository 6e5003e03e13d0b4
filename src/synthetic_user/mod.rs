//! The LLM playing the human side of the conversation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::conversation::UserReply;
use crate::providers::LLMProvider;
use crate::scenario::SyntheticUserConfig;
use crate::types::{ChatMessage, CompletionRequest};
use crate::LLMError;

pub mod prompts;

pub const EMPTY_AGENT_REPLY: &str = "I didn't receive a response. Could you try again?";
pub const EMPTY_USER_FALLBACK: &str = "Thanks, that answers my question.";

#[derive(Debug, Error)]
pub enum SimulatedUserError {
    #[error("simulated user failed to generate a response: {0}")]
    Provider(#[from] LLMError),

    #[error("failed to render simulated user prompt: {0}")]
    Prompt(#[from] handlebars::RenderError),
}

#[async_trait]
pub trait SimulatedUser: Send {
    /// The scenario's opening message. Does not touch conversation state.
    fn get_initial_query(&self) -> String;

    async fn respond(&mut self, agent_message: &str) -> Result<UserReply, SimulatedUserError>;

    async fn reset(&mut self);
}

/// Simulated user backed by an LLM.
///
/// History is kept from the user's point of view. When calling the model the
/// user and assistant roles are swapped, so the model speaks from the
/// assistant seat while playing the user.
pub struct LlmSimulatedUser {
    provider: Arc<dyn LLMProvider>,
    config: SyntheticUserConfig,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: String,
    history: Vec<ChatMessage>,
    questions_asked: u32,
}

impl LlmSimulatedUser {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        config: SyntheticUserConfig,
        llm: &LlmConfig,
    ) -> Result<Self, SimulatedUserError> {
        let system_prompt = prompts::build_system_prompt(&config, llm.extra_instructions.as_deref())?;
        Ok(Self {
            provider,
            config,
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            history: vec![ChatMessage::system(system_prompt.clone())],
            system_prompt,
            questions_asked: 0,
        })
    }

    /// How many agent messages so far were clarifying questions.
    pub fn questions_asked(&self) -> u32 {
        self.questions_asked
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn swapped_history(&self) -> Vec<ChatMessage> {
        self.history
            .iter()
            .map(|message| ChatMessage {
                role: message.role.swapped(),
                ..message.clone()
            })
            .collect()
    }
}

#[async_trait]
impl SimulatedUser for LlmSimulatedUser {
    fn get_initial_query(&self) -> String {
        self.config.initial_query.clone()
    }

    async fn respond(&mut self, agent_message: &str) -> Result<UserReply, SimulatedUserError> {
        if agent_message.trim().is_empty() {
            self.history.push(ChatMessage::assistant(agent_message));
            self.history.push(ChatMessage::user(EMPTY_AGENT_REPLY));
            return Ok(UserReply::new(EMPTY_AGENT_REPLY, 0));
        }

        self.history.push(ChatMessage::assistant(agent_message));
        if agent_message.trim_end().ends_with('?') {
            self.questions_asked += 1;
        }

        let request = CompletionRequest::new(self.model.clone(), self.swapped_history())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let response = self.provider.complete(request).await?;
        let tokens_used = response.tokens_used();

        let mut content = response.message.text().trim().to_string();
        if content.is_empty() {
            content = EMPTY_USER_FALLBACK.to_string();
        }
        debug!(tokens = tokens_used, questions = self.questions_asked, "simulated user replied");

        self.history.push(ChatMessage::user(content.clone()));
        Ok(UserReply::new(content, tokens_used))
    }

    async fn reset(&mut self) {
        self.history = vec![ChatMessage::system(self.system_prompt.clone())];
        self.questions_asked = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::scenario::ClarificationBehavior;
    use crate::types::{MessageRole, TokenUsage};

    fn user(provider: Arc<ScriptedProvider>) -> LlmSimulatedUser {
        let config = SyntheticUserConfig {
            persona: "Hiker".to_string(),
            initial_query: "Will it rain on Saturday?".to_string(),
            clarification_behavior: ClarificationBehavior::default(),
            max_turns: 5,
        };
        LlmSimulatedUser::new(provider, config, &LlmConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn empty_agent_message_gets_fixed_reply_without_llm_call() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut user = user(provider.clone());

        let reply = user.respond("   ").await.unwrap();
        assert_eq!(reply.message, EMPTY_AGENT_REPLY);
        assert_eq!(reply.tokens_used, 0);
        assert!(provider.requests().is_empty());
        assert_eq!(user.history().len(), 3);
    }

    #[tokio::test]
    async fn swaps_roles_and_counts_tokens() {
        let provider = Arc::new(
            ScriptedProvider::new().then_reply_with_usage("  Saturday, near Voss.  ", TokenUsage::new(40, 10)),
        );
        let mut user = user(provider.clone());

        let reply = user.respond("Which day and where?").await.unwrap();
        assert_eq!(reply.message, "Saturday, near Voss.");
        assert_eq!(reply.tokens_used, 50);
        assert_eq!(user.questions_asked(), 1);

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent[0].role, MessageRole::System);
        assert_eq!(sent[1].role, MessageRole::User);
        assert_eq!(sent[1].text(), "Which day and where?");
        assert_eq!(user.history()[2].role, MessageRole::User);
    }

    #[tokio::test]
    async fn empty_llm_output_becomes_satisfied_reply() {
        let provider = Arc::new(ScriptedProvider::from_replies([""]));
        let mut user = user(provider);
        let reply = user.respond("It will be sunny.").await.unwrap();
        assert_eq!(reply.message, EMPTY_USER_FALLBACK);
        assert_eq!(user.questions_asked(), 0);
    }

    #[tokio::test]
    async fn reset_restores_system_prompt_only() {
        let provider = Arc::new(ScriptedProvider::from_replies(["ok"]));
        let mut user = user(provider);
        user.respond("Where?").await.unwrap();
        user.reset().await;
        assert_eq!(user.history().len(), 1);
        assert_eq!(user.questions_asked(), 0);
        assert_eq!(user.get_initial_query(), "Will it rain on Saturday?");
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_error() {
        let provider = Arc::new(ScriptedProvider::new().then_error("down"));
        let mut user = user(provider);
        assert!(matches!(
            user.respond("Hello?").await,
            Err(SimulatedUserError::Provider(_))
        ));
    }
}
