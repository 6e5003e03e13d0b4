use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    tools::ToolCall,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
    LLMError,
};

/// Replays canned completions in order and records every request it receives.
/// Running past the end of the script is a provider error.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<CompletionResponse, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        replies
            .into_iter()
            .fold(Self::new(), |provider, reply| provider.then_reply(reply))
    }

    pub fn then_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(CompletionResponse {
            message: ChatMessage::assistant(text),
            usage: None,
            finish_reason: Some("stop".to_string()),
        }))
    }

    pub fn then_reply_with_usage(self, text: impl Into<String>, usage: TokenUsage) -> Self {
        self.push(Ok(CompletionResponse {
            message: ChatMessage::assistant(text),
            usage: Some(usage),
            finish_reason: Some("stop".to_string()),
        }))
    }

    pub fn then_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        let message = ChatMessage {
            content: None,
            ..ChatMessage::assistant("")
        }
        .with_tool_calls(calls);
        self.push(Ok(CompletionResponse {
            message,
            usage: None,
            finish_reason: Some("tool_calls".to_string()),
        }))
    }

    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()))
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    fn push(self, entry: Result<CompletionResponse, String>) -> Self {
        lock(&self.script).push_back(entry);
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        lock(&self.requests).push(request);
        match lock(&self.script).pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::ScriptedProvider;
    use crate::{
        providers::LLMProvider,
        types::{ChatMessage, CompletionRequest},
    };

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::from_replies(["first", "second"]);
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);

        let a = provider.complete(request.clone()).await.unwrap();
        let b = provider.complete(request.clone()).await.unwrap();
        assert_eq!(a.message.text(), "first");
        assert_eq!(b.message.text(), "second");

        let err = provider.complete(request).await.unwrap_err();
        assert!(err.to_string().contains("no more scripted responses"));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_errors_surface_as_provider_errors() {
        let provider = ScriptedProvider::new().then_error("rate limited");
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
        let err = provider.complete(request).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(provider.remaining(), 0);
    }
}
