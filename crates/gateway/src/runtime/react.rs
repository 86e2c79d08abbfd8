//! The reason–act loop.
//!
//! An explicit state object drives Thought → Action → Observation
//! iterations against one model handle and one tool set. Every
//! observable event goes through the [`StepSink`] before the loop
//! continues, so the caller can persist it and then publish it — the
//! ordering invariant (persist precedes publish) lives at that seam,
//! not here.
//!
//! Budget exhaustion (steps or wall clock) forces one last completion
//! with tools withheld; its text becomes the final answer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use fl_domain::chat::Message;
use fl_domain::config::WorkerConfig;
use fl_domain::frame::clip;
use fl_domain::{Error, Result};
use fl_providers::{ChatModel, ChatRequest};

use super::tools::ToolSet;

/// Grace period for the forced final-answer call once the wall clock is
/// already spent.
const FORCED_FINAL_GRACE: Duration = Duration::from_secs(30);

/// Consecutive malformed model replies tolerated before giving up.
const MALFORMED_LIMIT: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Thinking(String),
    ToolStart {
        tool_name: String,
    },
    ToolEnd {
        tool_name: String,
        ok: bool,
        summary: String,
    },
}

/// Where engine events go. The worker's sink persists a turn step and
/// publishes the corresponding frame; a sink error aborts the loop (the
/// store is the source of truth — running on without it would produce
/// unreplayable turns).
#[async_trait::async_trait]
pub trait StepSink: Send {
    async fn emit(&mut self, event: EngineEvent) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub max_steps: u32,
    pub wall_time: Duration,
    pub tool_timeout: Duration,
    pub max_observation_bytes: usize,
}

impl From<&WorkerConfig> for Budgets {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            max_steps: cfg.max_steps,
            wall_time: Duration::from_secs(cfg.max_turn_duration_secs),
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
            max_observation_bytes: cfg.max_observation_bytes,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReactEngine {
    model: Arc<dyn ChatModel>,
    budgets: Budgets,
}

impl ReactEngine {
    pub fn new(model: Arc<dyn ChatModel>, budgets: Budgets) -> Self {
        Self { model, budgets }
    }

    /// Run the loop to a final answer.
    pub async fn run(
        &self,
        question: &str,
        hints: &Value,
        tools: &ToolSet,
        sink: &mut dyn StepSink,
    ) -> Result<String> {
        let deadline = Instant::now() + self.budgets.wall_time;
        let mut history: Vec<Message> = vec![
            Message::system(system_prompt(tools)),
            Message::user(user_prompt(question, hints)),
        ];
        let mut steps_used: u32 = 0;
        let mut malformed_streak: u32 = 0;

        loop {
            if steps_used >= self.budgets.max_steps || Instant::now() >= deadline {
                return self.force_final(&mut history, deadline).await;
            }

            let resp = match self.complete_before(&history, tools, deadline).await {
                Ok(resp) => resp,
                // Wall clock ran out mid-call: still owe the user an
                // answer attempt before the turn fails.
                Err(Error::Timeout(_)) => return self.force_final(&mut history, deadline).await,
                Err(e) => return Err(e),
            };

            // Final answer: text with no tool calls.
            if resp.tool_calls.is_empty() {
                let text = resp.content.trim();
                if !text.is_empty() {
                    return Ok(text.to_string());
                }
                malformed_streak += 1;
                if malformed_streak >= MALFORMED_LIMIT {
                    return Err(Error::LlmProtocol(format!(
                        "{MALFORMED_LIMIT} consecutive malformed model responses"
                    )));
                }
                history.push(Message::user(
                    "Your last reply was empty. Either call a tool or state the final \
                     root cause analysis.",
                ));
                continue;
            }
            malformed_streak = 0;

            // Surface interleaved reasoning text before acting.
            let thought = resp.content.trim();
            if !thought.is_empty() {
                sink.emit(EngineEvent::Thinking(clip(thought))).await?;
            }

            for call in &resp.tool_calls {
                if steps_used >= self.budgets.max_steps || Instant::now() >= deadline {
                    return self.force_final(&mut history, deadline).await;
                }
                steps_used += 1;

                sink.emit(EngineEvent::ToolStart {
                    tool_name: call.tool_name.clone(),
                })
                .await?;

                let observation = tools
                    .invoke(
                        &call.tool_name,
                        &call.arguments,
                        self.budgets.tool_timeout,
                        self.budgets.max_observation_bytes,
                    )
                    .await;

                sink.emit(EngineEvent::ToolEnd {
                    tool_name: call.tool_name.clone(),
                    ok: !observation.is_error,
                    summary: clip(&observation.content),
                })
                .await?;

                history.push(Message::assistant_tool_use(thought, call));
                history.push(Message::tool_result(
                    &call.call_id,
                    &observation.content,
                    observation.is_error,
                ));
            }
        }
    }

    /// One completion bounded by the remaining wall clock.
    async fn complete_before(
        &self,
        history: &[Message],
        tools: &ToolSet,
        deadline: Instant,
    ) -> Result<fl_providers::ChatResponse> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout("turn wall clock exhausted".into()));
        }
        let req = ChatRequest {
            messages: history.to_vec(),
            tools: tools.definitions(),
            temperature: Some(0.1),
            max_tokens: None,
        };
        match tokio::time::timeout(remaining, self.model.complete(&req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("model call exceeded turn budget".into())),
        }
    }

    /// Budget exhausted: demand a final answer, tools withheld.
    async fn force_final(
        &self,
        history: &mut Vec<Message>,
        deadline: Instant,
    ) -> Result<String> {
        history.push(Message::user(
            "You have used up your investigation budget. Produce the final root cause \
             analysis now, based only on the observations so far. State what you found, \
             what you could not verify, and recommended next steps. Do not call any tools.",
        ));

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(FORCED_FINAL_GRACE);
        let req = ChatRequest {
            messages: history.clone(),
            tools: Vec::new(),
            temperature: Some(0.1),
            max_tokens: None,
        };
        let resp = match tokio::time::timeout(remaining, self.model.complete(&req)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(
                    "forced final answer exceeded turn budget".into(),
                ))
            }
        };

        let text = resp.content.trim();
        if text.is_empty() {
            return Err(Error::LlmProtocol(
                "model returned no text for the forced final answer".into(),
            ));
        }
        Ok(text.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn system_prompt(tools: &ToolSet) -> String {
    let tool_note = if tools.is_empty() {
        "No observability tools are connected for this workspace. Say so plainly and \
         reason from the question alone."
            .to_string()
    } else {
        format!(
            "You have {} tools over the workspace's observability and code integrations. \
             Investigate iteratively: check error logs first, confirm with metrics, and \
             correlate with recent code changes when a regression window emerges. Tool \
             results prefixed with ERROR: mean that path failed; try another tool rather \
             than repeating the same call.",
            tools.len()
        )
    };
    format!(
        "You are an SRE assistant performing root cause analysis on a production \
         incident. {tool_note}\n\nWhen you have enough evidence (or none can be \
         gathered), reply with the final analysis as Markdown: a one-line summary, the \
         evidence, the most likely root cause, and recommended next steps. Reply with \
         plain text only when giving the final answer; otherwise call tools."
    )
}

fn user_prompt(question: &str, hints: &Value) -> String {
    if hints.is_null() {
        question.to_string()
    } else {
        format!("{question}\n\nContext hints from the reporting channel: {hints}")
    }
}
