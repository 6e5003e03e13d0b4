//! Values produced while a conversation runs.
//!
//! Everything here is immutable once built: turns are appended to a transcript
//! and never edited, and a [`ConversationOutcome`] is assembled exactly once
//! when the orchestration loop ends.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One tool call made by the agent under test, with either its result or its error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    tool_name: String,
    parameters: Map<String, Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    latency_ms: f64,
}

impl ToolInvocation {
    pub fn succeeded(
        tool_name: impl Into<String>,
        parameters: Map<String, Value>,
        result: Value,
        latency: Duration,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            result: Some(result),
            error: None,
            latency_ms: latency.as_secs_f64() * 1000.0,
        }
    }

    pub fn failed(
        tool_name: impl Into<String>,
        parameters: Map<String, Value>,
        error: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            result: None,
            error: Some(error.into()),
            latency_ms: latency.as_secs_f64() * 1000.0,
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One message in the transcript.
///
/// `timestamp` is wall-clock for humans reading saved results; `elapsed_ms`
/// is measured on a monotonic clock from the start of the run and is what
/// ordering and timing checks should rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolInvocation>,
    timestamp: DateTime<Utc>,
    elapsed_ms: u64,
}

impl Turn {
    pub fn user(content: impl Into<String>, elapsed: Duration) -> Self {
        Self::new(Role::User, content.into(), Vec::new(), elapsed)
    }

    pub fn assistant(
        content: impl Into<String>,
        tool_calls: Vec<ToolInvocation>,
        elapsed: Duration,
    ) -> Self {
        Self::new(Role::Assistant, content.into(), tool_calls, elapsed)
    }

    fn new(role: Role, content: String, tool_calls: Vec<ToolInvocation>, elapsed: Duration) -> Self {
        Self {
            role,
            content,
            tool_calls,
            timestamp: Utc::now(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_calls(&self) -> &[ToolInvocation] {
        &self.tool_calls
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// What the agent under test returns for one user message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub message: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolInvocation>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn complete(mut self, is_complete: bool) -> Self {
        self.is_complete = is_complete;
        self
    }
}

/// What the simulated user says back, and what it cost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReply {
    pub message: String,
    #[serde(default)]
    pub tokens_used: u64,
}

impl UserReply {
    pub fn new(message: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            message: message.into(),
            tokens_used,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    CriteriaMet,
    MaxTurns,
    LoopDetected,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::CriteriaMet => "criteria_met",
            TerminationReason::MaxTurns => "max_turns",
            TerminationReason::LoopDetected => "loop_detected",
            TerminationReason::Error => "error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The finished transcript of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    turns: Vec<Turn>,
    final_answer: String,
    total_tool_calls: Vec<ToolInvocation>,
    total_tokens: u64,
    duration_seconds: f64,
    termination_reason: TerminationReason,
}

impl ConversationOutcome {
    /// Assemble the outcome. The flattened tool-call list is derived from the
    /// assistant turns so it always matches them, in turn order.
    pub(crate) fn new(
        turns: Vec<Turn>,
        final_answer: String,
        total_tokens: u64,
        duration: Duration,
        termination_reason: TerminationReason,
    ) -> Self {
        let total_tool_calls = turns
            .iter()
            .flat_map(|turn| turn.tool_calls.iter().cloned())
            .collect();

        Self {
            turns,
            final_answer,
            total_tool_calls,
            total_tokens,
            duration_seconds: duration.as_secs_f64(),
            termination_reason,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn final_answer(&self) -> &str {
        &self.final_answer
    }

    pub fn total_tool_calls(&self) -> &[ToolInvocation] {
        &self.total_tool_calls
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn termination_reason(&self) -> TerminationReason {
        self.termination_reason
    }

    pub fn agent_turns(&self) -> usize {
        self.turns.iter().filter(|turn| turn.is_assistant()).count()
    }

    /// Names of every tool the agent invoked, first use order, no repeats.
    pub fn tools_used(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for call in &self.total_tool_calls {
            if !seen.contains(&call.tool_name()) {
                seen.push(call.tool_name());
            }
        }
        seen
    }
}

/// Content of the most recent assistant turn, searching backwards.
pub fn last_assistant_content(turns: &[Turn]) -> Option<&str> {
    turns
        .iter()
        .rev()
        .find(|turn| turn.is_assistant())
        .map(Turn::content)
}
