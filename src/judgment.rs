//! What the judge hands back: the per-turn criteria check and the final verdict.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conversation::ConversationOutcome;
use crate::scenario::EvaluationConfig;

/// Lightweight "has the question been answered yet" verdict, produced after
/// every agent turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CriteriaCheck {
    pub all_criteria_met: bool,
    #[serde(default)]
    pub correctness_results: BTreeMap<String, bool>,
    #[serde(default)]
    pub brief_reasoning: String,
}

impl CriteriaCheck {
    pub fn met(reasoning: impl Into<String>) -> Self {
        Self {
            all_criteria_met: true,
            correctness_results: BTreeMap::new(),
            brief_reasoning: reasoning.into(),
        }
    }

    pub fn not_met(reasoning: impl Into<String>) -> Self {
        Self {
            all_criteria_met: false,
            correctness_results: BTreeMap::new(),
            brief_reasoning: reasoning.into(),
        }
    }
}

/// Which of the scenario's required and prohibited tools the agent actually used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageResults {
    pub required_tools: Vec<String>,
    pub required_tools_used: Vec<String>,
    pub prohibited_tools: Vec<String>,
    pub prohibited_tools_used: Vec<String>,
    pub all_required_used: bool,
    pub no_prohibited_used: bool,
}

impl ToolUsageResults {
    pub fn from_outcome(evaluation: &EvaluationConfig, outcome: &ConversationOutcome) -> Self {
        let used = outcome.tools_used();
        let usage = &evaluation.tool_usage;

        let required_tools_used: Vec<String> = usage
            .required_tools
            .iter()
            .filter(|tool| used.contains(&tool.as_str()))
            .cloned()
            .collect();
        let prohibited_tools_used: Vec<String> = usage
            .prohibited_tools
            .iter()
            .filter(|tool| used.contains(&tool.as_str()))
            .cloned()
            .collect();

        Self {
            all_required_used: required_tools_used.len() == usage.required_tools.len(),
            no_prohibited_used: prohibited_tools_used.is_empty(),
            required_tools: usage.required_tools.clone(),
            required_tools_used,
            prohibited_tools: usage.prohibited_tools.clone(),
            prohibited_tools_used,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfficiencyResults {
    pub total_tool_calls: usize,
    #[serde(default)]
    pub max_tool_calls: Option<u32>,
    pub total_turns: usize,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub max_llm_tokens: Option<u64>,
    pub within_limits: bool,
}

impl EfficiencyResults {
    pub fn from_outcome(evaluation: &EvaluationConfig, outcome: &ConversationOutcome) -> Self {
        let limits = &evaluation.efficiency;
        let total_tool_calls = outcome.total_tool_calls().len();
        let total_turns = outcome.turns().len();
        let total_tokens = outcome.total_tokens();

        let within = |actual: u64, limit: Option<u64>| limit.map_or(true, |max| actual <= max);
        let within_limits = within(total_tool_calls as u64, limits.max_tool_calls.map(u64::from))
            && within(total_turns as u64, limits.max_conversation_turns.map(u64::from))
            && within(total_tokens, limits.max_llm_tokens);

        Self {
            total_tool_calls,
            max_tool_calls: limits.max_tool_calls,
            total_turns,
            max_turns: limits.max_conversation_turns,
            total_tokens,
            max_llm_tokens: limits.max_llm_tokens,
            within_limits,
        }
    }
}

/// Final verdict for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    pub passed: bool,
    pub score: f64,
    pub correctness_results: BTreeMap<String, bool>,
    /// Criterion to whether it was triggered.
    pub failure_results: BTreeMap<String, bool>,
    pub tool_usage_results: ToolUsageResults,
    pub efficiency_results: EfficiencyResults,
    pub reasoning: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map};

    use super::*;
    use crate::conversation::{TerminationReason, ToolInvocation, Turn};
    use crate::scenario::{EfficiencyConfig, ToolUsageConfig};

    fn evaluation() -> EvaluationConfig {
        EvaluationConfig {
            correctness_criteria: vec!["answers".to_string()],
            failure_criteria: Vec::new(),
            tool_usage: ToolUsageConfig {
                required_tools: vec!["get_weather".to_string(), "geocode".to_string()],
                prohibited_tools: vec!["delete_city".to_string()],
                ..ToolUsageConfig::default()
            },
            efficiency: EfficiencyConfig {
                max_tool_calls: Some(2),
                max_llm_tokens: None,
                max_conversation_turns: Some(4),
            },
        }
    }

    fn outcome(tools: &[&str]) -> ConversationOutcome {
        let calls = tools
            .iter()
            .map(|name| ToolInvocation::succeeded(*name, Map::new(), json!(null), Duration::ZERO))
            .collect();
        ConversationOutcome::new(
            vec![
                Turn::user("q", Duration::ZERO),
                Turn::assistant("a", calls, Duration::ZERO),
            ],
            "a".to_string(),
            12,
            Duration::ZERO,
            TerminationReason::CriteriaMet,
        )
    }

    #[test]
    fn tool_usage_reflects_what_was_called() {
        let results = ToolUsageResults::from_outcome(&evaluation(), &outcome(&["get_weather"]));
        assert_eq!(results.required_tools_used, ["get_weather"]);
        assert!(!results.all_required_used);
        assert!(results.no_prohibited_used);

        let results = ToolUsageResults::from_outcome(
            &evaluation(),
            &outcome(&["geocode", "get_weather", "delete_city"]),
        );
        assert!(results.all_required_used);
        assert_eq!(results.prohibited_tools_used, ["delete_city"]);
        assert!(!results.no_prohibited_used);
    }

    #[test]
    fn efficiency_checks_every_configured_limit() {
        let ok = EfficiencyResults::from_outcome(&evaluation(), &outcome(&["a", "b"]));
        assert_eq!(ok.total_tool_calls, 2);
        assert_eq!(ok.total_turns, 2);
        assert_eq!(ok.total_tokens, 12);
        assert!(ok.within_limits);

        let over = EfficiencyResults::from_outcome(&evaluation(), &outcome(&["a", "b", "c"]));
        assert!(!over.within_limits);
    }
}
