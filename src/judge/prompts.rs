use handlebars::RenderError;
use serde::Serialize;
use serde_json::Value;

use crate::conversation::{ConversationOutcome, ToolInvocation, Turn};
use crate::prompt::{bullet_list, render, truncate};
use crate::scenario::TestScenario;

pub const TRANSCRIPT_RESULT_CHARS: usize = 200;
pub const TOOL_CALL_RESULT_CHARS: usize = 100;

const CRITERIA_CHECK_PROMPT: &str = r#"You are monitoring a conversation between a user and an AI assistant.
Decide whether the assistant has ALREADY satisfied every correctness criterion below.
Judge only what has been said so far; do not assume future answers.

## User's Initial Query
{{initial_query}}

## Correctness Criteria
{{criteria}}

## Conversation So Far
{{transcript}}

Respond with JSON only:
{"all_criteria_met": true/false, "correctness_results": {"criterion": true/false, ...}, "brief_reasoning": "one sentence"}
"#;

const EVALUATION_PROMPT: &str = r#"You are evaluating an AI agent's performance on a user assistance task.

## Test Scenario
{{description}}

## User's Goal
{{persona}}

## User's Initial Query
{{initial_query}}

## Conversation Transcript
{{transcript}}

## Tool Calls Made
{{tool_calls}}

## Evaluation Criteria

### Correctness (all must be satisfied for pass)
{{correctness_criteria}}

### Failure Conditions (any triggered = fail)
{{failure_criteria}}

### Tool Usage Requirements
Required tools: {{required_tools}}
Prohibited tools: {{prohibited_tools}}

### Efficiency Targets
Max tool calls: {{max_tool_calls}}
Max conversation turns: {{max_turns}}

## Your Task
Evaluate the conversation and provide your assessment in JSON format:
{
    "passed": true/false,
    "score": 0.0-1.0,
    "correctness_results": {"criterion": true/false, ...},
    "failure_results": {"criterion": true/false, ...},
    "reasoning": "Brief explanation of your judgment",
    "suggestions": ["Improvement suggestions for the tools if applicable"]
}
{{#if extra_instructions}}

## Additional Instructions
{{extra_instructions}}
{{/if}}"#;

#[derive(Serialize)]
struct CriteriaData {
    initial_query: String,
    criteria: String,
    transcript: String,
}

#[derive(Serialize)]
struct EvaluationData<'a> {
    description: &'a str,
    persona: &'a str,
    initial_query: &'a str,
    transcript: String,
    tool_calls: String,
    correctness_criteria: String,
    failure_criteria: String,
    required_tools: String,
    prohibited_tools: String,
    max_tool_calls: String,
    max_turns: String,
    extra_instructions: Option<&'a str>,
}

pub fn build_criteria_prompt(scenario: &TestScenario, turns: &[Turn]) -> Result<String, RenderError> {
    let data = CriteriaData {
        initial_query: scenario.synthetic_user.initial_query.clone(),
        criteria: bullet_list(&scenario.evaluation.correctness_criteria, "None specified"),
        transcript: format_transcript(turns),
    };
    render(CRITERIA_CHECK_PROMPT, &data)
}

pub fn build_evaluation_prompt(
    scenario: &TestScenario,
    outcome: &ConversationOutcome,
    extra_instructions: Option<&str>,
) -> Result<String, RenderError> {
    let evaluation = &scenario.evaluation;
    let usage = &evaluation.tool_usage;
    let limits = &evaluation.efficiency;

    let data = EvaluationData {
        description: &scenario.description,
        persona: &scenario.synthetic_user.persona,
        initial_query: &scenario.synthetic_user.initial_query,
        transcript: format_transcript(outcome.turns()),
        tool_calls: format_tool_calls(outcome.total_tool_calls()),
        correctness_criteria: bullet_list(&evaluation.correctness_criteria, "None specified"),
        failure_criteria: bullet_list(&evaluation.failure_criteria, "None specified"),
        required_tools: join_or_none(&usage.required_tools),
        prohibited_tools: join_or_none(&usage.prohibited_tools),
        max_tool_calls: limits
            .max_tool_calls
            .map_or_else(|| "No limit".to_string(), |n| n.to_string()),
        max_turns: limits
            .max_conversation_turns
            .map_or_else(|| "No limit".to_string(), |n| n.to_string()),
        extra_instructions: extra_instructions.filter(|text| !text.trim().is_empty()),
    };
    render(EVALUATION_PROMPT, &data)
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "None".to_string()
    } else {
        items.join(", ")
    }
}

fn result_text(result: Option<&Value>) -> String {
    match result {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => "null".to_string(),
    }
}

fn parameters_text(call: &ToolInvocation) -> String {
    Value::Object(call.parameters().clone()).to_string()
}

/// `[ROLE]: content` lines, with each tool call and its (truncated) result.
pub fn format_transcript(turns: &[Turn]) -> String {
    let mut lines = Vec::new();
    for turn in turns {
        lines.push(format!(
            "[{}]: {}",
            turn.role().to_string().to_uppercase(),
            turn.content()
        ));
        for call in turn.tool_calls() {
            lines.push(format!("  -> Tool call: {}({})", call.tool_name(), parameters_text(call)));
            match call.error() {
                Some(error) => lines.push(format!("     Error: {error}")),
                None => lines.push(format!(
                    "     Result: {}",
                    truncate(&result_text(call.result()), TRANSCRIPT_RESULT_CHARS)
                )),
            }
        }
    }
    lines.join("\n")
}

pub fn format_tool_calls(calls: &[ToolInvocation]) -> String {
    if calls.is_empty() {
        return "No tool calls were made.".to_string();
    }

    let mut lines = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, call.tool_name()));
        lines.push(format!("   Parameters: {}", parameters_text(call)));
        match call.error() {
            Some(error) => lines.push(format!("   Error: {error}")),
            None => lines.push(format!(
                "   Result: {}",
                truncate(&result_text(call.result()), TOOL_CALL_RESULT_CHARS)
            )),
        }
        lines.push(format!("   Latency: {:.1}ms", call.latency_ms()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map};

    use super::*;

    #[test]
    fn transcript_truncates_long_results_and_shows_errors() {
        let long = "x".repeat(300);
        let turns = vec![
            Turn::user("find it", Duration::ZERO),
            Turn::assistant(
                "here",
                vec![
                    ToolInvocation::succeeded("search", Map::new(), json!(long), Duration::ZERO),
                    ToolInvocation::failed("fetch", Map::new(), "404", Duration::ZERO),
                ],
                Duration::ZERO,
            ),
        ];

        let text = format_transcript(&turns);
        assert!(text.starts_with("[USER]: find it\n[ASSISTANT]: here"));
        assert!(text.contains(&format!("Result: {}...", "x".repeat(TRANSCRIPT_RESULT_CHARS))));
        assert!(text.contains("Error: 404"));
    }

    #[test]
    fn tool_call_list_numbers_calls_and_reports_latency() {
        let mut params = Map::new();
        params.insert("city".to_string(), json!("Oslo"));
        let calls = vec![ToolInvocation::succeeded(
            "get_weather",
            params,
            json!({"temp_c": 12}),
            Duration::from_micros(12_345),
        )];

        let text = format_tool_calls(&calls);
        assert!(text.contains("1. get_weather"));
        assert!(text.contains(r#"Parameters: {"city":"Oslo"}"#));
        assert!(text.contains("Latency: 12.3ms"));
        assert_eq!(format_tool_calls(&[]), "No tool calls were made.");
    }
}
