use serde::{Deserialize, Serialize};

use crate::turn::{StepStatus, StepType, TurnStep};

/// Maximum characters carried by thinking and tool_end frames.
pub const FRAME_CONTENT_MAX: usize = 500;

/// One ordered progress event for a turn.
///
/// Frames are what subscribers see: each persisted [`TurnStep`] maps to
/// exactly one frame, and the worker appends a terminal `complete` or
/// `error` frame when the turn finishes. Non-terminal frames carry the
/// step sequence so late-joining subscribers can deduplicate replayed
/// history against live bus traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Status {
        sequence: u32,
        content: String,
    },
    ToolStart {
        sequence: u32,
        tool_name: String,
    },
    ToolEnd {
        sequence: u32,
        tool_name: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Thinking {
        sequence: u32,
        content: String,
    },
    Complete {
        final_response: String,
    },
    Error {
        message: String,
    },
}

impl Frame {
    /// Step sequence this frame corresponds to; terminal frames have none.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Frame::Status { sequence, .. }
            | Frame::ToolStart { sequence, .. }
            | Frame::ToolEnd { sequence, .. }
            | Frame::Thinking { sequence, .. } => Some(*sequence),
            Frame::Complete { .. } | Frame::Error { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Complete { .. } | Frame::Error { .. })
    }

    /// Convert a persisted step into its replay frame.
    ///
    /// Tool-call steps split on their status: a `Running` step is the
    /// dispatch (tool_start), any other status is the result (tool_end).
    pub fn from_step(step: &TurnStep) -> Frame {
        let content = || step.content.clone().unwrap_or_default();
        match step.step_type {
            StepType::Status => Frame::Status {
                sequence: step.sequence,
                content: content(),
            },
            StepType::Thinking => Frame::Thinking {
                sequence: step.sequence,
                content: clip(&content()),
            },
            StepType::ToolCall => {
                let tool_name = step.tool_name.clone().unwrap_or_default();
                if step.step_status == StepStatus::Running {
                    Frame::ToolStart {
                        sequence: step.sequence,
                        tool_name,
                    }
                } else {
                    Frame::ToolEnd {
                        sequence: step.sequence,
                        tool_name,
                        status: step.step_status,
                        content: step.content.as_deref().map(clip),
                    }
                }
            }
        }
    }
}

/// Clip frame content to [`FRAME_CONTENT_MAX`] characters.
pub fn clip(s: &str) -> String {
    if s.chars().count() <= FRAME_CONTENT_MAX {
        s.to_string()
    } else {
        s.chars().take(FRAME_CONTENT_MAX).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn step(step_type: StepType, step_status: StepStatus, seq: u32) -> TurnStep {
        TurnStep {
            id: Uuid::new_v4(),
            turn_id: Uuid::new_v4(),
            step_type,
            tool_name: Some("logs.errors.loki".into()),
            content: Some("found 3 errors".into()),
            step_status,
            sequence: seq,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn running_tool_step_becomes_tool_start() {
        let f = Frame::from_step(&step(StepType::ToolCall, StepStatus::Running, 3));
        assert!(matches!(f, Frame::ToolStart { sequence: 3, .. }));
    }

    #[test]
    fn finished_tool_step_becomes_tool_end() {
        let f = Frame::from_step(&step(StepType::ToolCall, StepStatus::Failed, 4));
        match f {
            Frame::ToolEnd { status, .. } => assert_eq!(status, StepStatus::Failed),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn terminal_frames_have_no_sequence() {
        assert_eq!(Frame::Complete { final_response: "done".into() }.sequence(), None);
        assert!(Frame::Error { message: "boom".into() }.is_terminal());
    }

    #[test]
    fn clip_bounds_content() {
        let long = "x".repeat(2 * FRAME_CONTENT_MAX);
        assert_eq!(clip(&long).chars().count(), FRAME_CONTENT_MAX);
    }

    #[test]
    fn frame_serializes_with_type_tag() {
        let f = Frame::Status { sequence: 1, content: "Queued".into() };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["sequence"], 1);
    }
}
