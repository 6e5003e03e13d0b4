pub mod agents;
pub mod config;
pub mod conversation;
pub mod error;
pub mod judge;
pub mod judgment;
pub mod loop_detector;
pub mod mcp;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod providers;
pub mod scenario;
pub mod synthetic_user;
pub mod tools;
pub mod types;

pub use agents::{AgentError, AgentKind, AgentUnderTest, ChatSettings};
pub use agents::simple::SimpleAgent;
pub use agents::tool::ToolAgent;
pub use config::{ConfigError, FileConfig, LlmConfig, ReasoningLevel};
pub use conversation::{
    AgentReply, ConversationOutcome, Role, TerminationReason, ToolInvocation, Turn, UserReply,
};
pub use error::LLMError;
pub use judge::{Judge, JudgmentError, LlmJudge};
pub use judgment::{CriteriaCheck, EfficiencyResults, JudgmentResult, ToolUsageResults};
pub use mcp::{McpConnection, McpError, McpServer};
pub use orchestrator::{ConversationEvent, ConversationOrchestrator, OrchestrationError};
pub use persistence::{ResultStorage, StorageError, TestRunResult};
pub use providers::LLMProvider;
pub use scenario::{ScenarioError, ScenarioParser, TestScenario};
pub use synthetic_user::{LlmSimulatedUser, SimulatedUser, SimulatedUserError};
pub use tools::{ToolDefinition, ToolFunction, ToolRegistry};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
