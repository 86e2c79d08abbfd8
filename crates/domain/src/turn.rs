use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Processing => "processing",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TurnStatus::Pending),
            "processing" => Some(TurnStatus::Processing),
            "completed" => Some(TurnStatus::Completed),
            "failed" => Some(TurnStatus::Failed),
            _ => None,
        }
    }
}

/// One (question, answer) unit inside a session.
///
/// Exactly one job exists per turn; the final response stays `None` until
/// the orchestrator completes the analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_message: String,
    pub final_response: Option<String>,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Status,
    ToolCall,
    Thinking,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Status => "status",
            StepType::ToolCall => "tool_call",
            StepType::Thinking => "thinking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status" => Some(StepType::Status),
            "tool_call" => Some(StepType::ToolCall),
            "thinking" => Some(StepType::Thinking),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// One observable event within a turn.
///
/// Sequences are strictly increasing, gap-free, starting at 1; the store
/// assigns them under the turn's row lock. A tool invocation produces two
/// steps: a `ToolCall`/`Running` step when dispatch begins and a
/// `ToolCall`/`Completed|Failed` step carrying the observation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStep {
    pub id: Uuid,
    pub turn_id: Uuid,
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub content: Option<String>,
    pub step_status: StepStatus,
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
}

/// A new step awaiting sequence assignment by the store.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub step_type: StepType,
    pub tool_name: Option<String>,
    pub content: Option<String>,
    pub step_status: StepStatus,
}

impl NewStep {
    pub fn status(content: impl Into<String>) -> Self {
        Self {
            step_type: StepType::Status,
            tool_name: None,
            content: Some(content.into()),
            step_status: StepStatus::Completed,
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            step_type: StepType::Thinking,
            tool_name: None,
            content: Some(content.into()),
            step_status: StepStatus::Completed,
        }
    }

    pub fn tool_start(tool_name: impl Into<String>) -> Self {
        Self {
            step_type: StepType::ToolCall,
            tool_name: Some(tool_name.into()),
            content: None,
            step_status: StepStatus::Running,
        }
    }

    pub fn tool_end(tool_name: impl Into<String>, ok: bool, summary: impl Into<String>) -> Self {
        Self {
            step_type: StepType::ToolCall,
            tool_name: Some(tool_name.into()),
            content: Some(summary.into()),
            step_status: if ok { StepStatus::Completed } else { StepStatus::Failed },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Feedback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A thumbs-up/down rating for a completed turn. Unique per (turn, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub turn_id: Uuid,
    pub user_id: String,
    /// -1 or +1.
    pub score: i8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}
