//! Drives one scenario from the opening query to a judged outcome.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agents::{AgentError, AgentUnderTest};
use crate::conversation::{last_assistant_content, ConversationOutcome, TerminationReason, Turn};
use crate::judge::{Judge, JudgmentError};
use crate::judgment::JudgmentResult;
use crate::loop_detector::should_stop_for_loop;
use crate::scenario::TestScenario;
use crate::synthetic_user::{SimulatedUser, SimulatedUserError};

/// A collaborator failed; the run is abandoned and nothing is returned.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("agent failed on turn {turn}: {source}")]
    Agent {
        turn: u32,
        #[source]
        source: AgentError,
    },

    #[error("judge criteria check failed on turn {turn}: {source}")]
    CriteriaCheck {
        turn: u32,
        #[source]
        source: JudgmentError,
    },

    #[error("simulated user failed on turn {turn}: {source}")]
    SimulatedUser {
        turn: u32,
        #[source]
        source: SimulatedUserError,
    },

    #[error("final evaluation failed: {0}")]
    Evaluation(#[source] JudgmentError),
}

impl OrchestrationError {
    pub fn stage(&self) -> &'static str {
        match self {
            OrchestrationError::Agent { .. } => "agent",
            OrchestrationError::CriteriaCheck { .. } => "criteria_check",
            OrchestrationError::SimulatedUser { .. } => "simulated_user",
            OrchestrationError::Evaluation(_) => "evaluation",
        }
    }

    pub fn termination_reason(&self) -> TerminationReason {
        TerminationReason::Error
    }
}

/// Progress notifications, in the order things happen.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Started { scenario: String, max_turns: u32 },
    UserMessage { turn: u32, message: String },
    AgentMessage { turn: u32, message: String, tool_calls: usize },
    CriteriaChecked { turn: u32, met: bool, reasoning: String },
    Finished { reason: TerminationReason },
}

type EventCallback = Arc<dyn Fn(&ConversationEvent) + Send + Sync>;

/// Runs conversations between an agent, a simulated user and a judge.
///
/// `run` takes `&mut self`, so one orchestrator runs one conversation at a
/// time. It can be reused for further scenarios; both the agent and the user
/// are reset at the start of every run.
pub struct ConversationOrchestrator {
    agent: Box<dyn AgentUnderTest>,
    user: Box<dyn SimulatedUser>,
    judge: Box<dyn Judge>,
    event_callback: Option<EventCallback>,
}

impl ConversationOrchestrator {
    pub fn new(
        agent: Box<dyn AgentUnderTest>,
        user: Box<dyn SimulatedUser>,
        judge: Box<dyn Judge>,
    ) -> Self {
        Self {
            agent,
            user,
            judge,
            event_callback: None,
        }
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&ConversationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn agent(&self) -> &dyn AgentUnderTest {
        self.agent.as_ref()
    }

    fn emit(&self, event: ConversationEvent) {
        if let Some(callback) = &self.event_callback {
            callback(&event);
        }
    }

    fn fail(&self, scenario: &TestScenario, error: OrchestrationError) -> OrchestrationError {
        warn!(
            scenario = %scenario.name,
            stage = error.stage(),
            termination_reason = %error.termination_reason(),
            error = %error,
            "conversation aborted"
        );
        self.emit(ConversationEvent::Finished {
            reason: error.termination_reason(),
        });
        error
    }

    pub async fn run(
        &mut self,
        scenario: &TestScenario,
    ) -> Result<(ConversationOutcome, JudgmentResult), OrchestrationError> {
        let started = Instant::now();
        let max_turns = scenario.max_turns();
        info!(scenario = %scenario.name, max_turns, "starting conversation");
        self.emit(ConversationEvent::Started {
            scenario: scenario.name.clone(),
            max_turns,
        });

        self.agent.reset().await;
        self.user.reset().await;

        let mut turns: Vec<Turn> = Vec::new();
        let mut total_tokens: u64 = 0;
        let mut ended: Option<(TerminationReason, String)> = None;
        let mut turn_count: u32 = 0;

        let mut user_message = self.user.get_initial_query();
        turns.push(Turn::user(user_message.clone(), started.elapsed()));
        self.emit(ConversationEvent::UserMessage {
            turn: 0,
            message: user_message.clone(),
        });

        while turn_count < max_turns {
            turn_count += 1;

            let reply = match self.agent.send_message(&user_message).await {
                Ok(reply) => reply,
                Err(source) => {
                    let error = OrchestrationError::Agent { turn: turn_count, source };
                    return Err(self.fail(scenario, error));
                }
            };
            debug!(
                turn = turn_count,
                tool_calls = reply.tool_calls.len(),
                is_complete = reply.is_complete,
                "agent turn"
            );
            self.emit(ConversationEvent::AgentMessage {
                turn: turn_count,
                message: reply.message.clone(),
                tool_calls: reply.tool_calls.len(),
            });
            let agent_message = reply.message;
            turns.push(Turn::assistant(
                agent_message.clone(),
                reply.tool_calls,
                started.elapsed(),
            ));

            let check = match self.judge.check_criteria(scenario, &turns).await {
                Ok(check) => check,
                Err(source) => {
                    let error = OrchestrationError::CriteriaCheck { turn: turn_count, source };
                    return Err(self.fail(scenario, error));
                }
            };
            self.emit(ConversationEvent::CriteriaChecked {
                turn: turn_count,
                met: check.all_criteria_met,
                reasoning: check.brief_reasoning.clone(),
            });
            if check.all_criteria_met {
                ended = Some((TerminationReason::CriteriaMet, agent_message));
                break;
            }

            let user_reply = match self.user.respond(&agent_message).await {
                Ok(reply) => reply,
                Err(source) => {
                    let error = OrchestrationError::SimulatedUser { turn: turn_count, source };
                    return Err(self.fail(scenario, error));
                }
            };
            total_tokens += user_reply.tokens_used;
            debug!(turn = turn_count, tokens = user_reply.tokens_used, "user turn");
            self.emit(ConversationEvent::UserMessage {
                turn: turn_count,
                message: user_reply.message.clone(),
            });
            turns.push(Turn::user(user_reply.message.clone(), started.elapsed()));

            if should_stop_for_loop(&turns) {
                ended = Some((TerminationReason::LoopDetected, agent_message));
                break;
            }

            user_message = user_reply.message;
        }

        let (reason, final_answer) = ended.unwrap_or_else(|| {
            let last = last_assistant_content(&turns).unwrap_or_default().to_string();
            (TerminationReason::MaxTurns, last)
        });

        let outcome =
            ConversationOutcome::new(turns, final_answer, total_tokens, started.elapsed(), reason);
        info!(
            scenario = %scenario.name,
            termination_reason = %reason,
            agent_turns = turn_count,
            tokens = total_tokens,
            tool_calls = outcome.total_tool_calls().len(),
            "conversation finished"
        );

        let judgment = match self.judge.evaluate(scenario, &outcome).await {
            Ok(judgment) => judgment,
            Err(source) => return Err(self.fail(scenario, OrchestrationError::Evaluation(source))),
        };
        self.emit(ConversationEvent::Finished { reason });

        Ok((outcome, judgment))
    }
}
