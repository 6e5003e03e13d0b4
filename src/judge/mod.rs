//! Deciding when a conversation is done, and whether it passed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::conversation::{ConversationOutcome, Turn};
use crate::judgment::{CriteriaCheck, EfficiencyResults, JudgmentResult, ToolUsageResults};
use crate::providers::{complete_json, LLMProvider};
use crate::scenario::TestScenario;
use crate::types::{ChatMessage, CompletionRequest};
use crate::LLMError;

pub mod prompts;

#[derive(Debug, Error)]
pub enum JudgmentError {
    #[error("judge evaluation failed: {0}")]
    Provider(#[from] LLMError),

    #[error("failed to render judge prompt: {0}")]
    Prompt(#[from] handlebars::RenderError),
}

#[async_trait]
pub trait Judge: Send + Sync {
    /// Cheap check run after every agent turn: has the question been answered?
    async fn check_criteria(
        &self,
        scenario: &TestScenario,
        turns: &[Turn],
    ) -> Result<CriteriaCheck, JudgmentError>;

    /// Full evaluation of the finished conversation. Called once per run.
    async fn evaluate(
        &self,
        scenario: &TestScenario,
        outcome: &ConversationOutcome,
    ) -> Result<JudgmentResult, JudgmentError>;
}

/// The part of the verdict the model decides; tool usage and efficiency are
/// computed from the transcript instead.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JudgeEvaluation {
    pub passed: bool,
    pub score: f64,
    #[serde(default)]
    pub correctness_results: BTreeMap<String, bool>,
    #[serde(default)]
    pub failure_results: BTreeMap<String, bool>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl JudgeEvaluation {
    pub fn into_judgment(self, scenario: &TestScenario, outcome: &ConversationOutcome) -> JudgmentResult {
        let score = if self.score.is_finite() {
            self.score.clamp(0.0, 1.0)
        } else {
            0.0
        };

        JudgmentResult {
            passed: self.passed,
            score,
            correctness_results: self.correctness_results,
            failure_results: self.failure_results,
            tool_usage_results: ToolUsageResults::from_outcome(&scenario.evaluation, outcome),
            efficiency_results: EfficiencyResults::from_outcome(&scenario.evaluation, outcome),
            reasoning: self.reasoning,
            suggestions: self.suggestions,
        }
    }
}

pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    extra_instructions: Option<String>,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, llm: &LlmConfig) -> Self {
        Self {
            provider,
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            extra_instructions: llm.extra_instructions.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn check_criteria(
        &self,
        scenario: &TestScenario,
        turns: &[Turn],
    ) -> Result<CriteriaCheck, JudgmentError> {
        let prompt = prompts::build_criteria_prompt(scenario, turns)?;
        let (check, _usage): (CriteriaCheck, _) =
            complete_json(self.provider.as_ref(), self.request(prompt)).await?;
        debug!(
            scenario = %scenario.name,
            met = check.all_criteria_met,
            reasoning = %check.brief_reasoning,
            "criteria check"
        );
        Ok(check)
    }

    async fn evaluate(
        &self,
        scenario: &TestScenario,
        outcome: &ConversationOutcome,
    ) -> Result<JudgmentResult, JudgmentError> {
        let prompt =
            prompts::build_evaluation_prompt(scenario, outcome, self.extra_instructions.as_deref())?;
        let (evaluation, _usage): (JudgeEvaluation, _) =
            complete_json(self.provider.as_ref(), self.request(prompt)).await?;
        Ok(evaluation.into_judgment(scenario, outcome))
    }
}
