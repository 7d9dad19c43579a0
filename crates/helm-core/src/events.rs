use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ToolUseId};

/// Name of the tool that spawns a sub-task.
pub const TASK_TOOL_NAME: &str = "Task";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A message update handed to the persistence sink.
///
/// `streaming == false` is the persistence trigger: the sink writes the
/// message durably exactly when it sees a finalized update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub id: MessageId,
    pub session_id: SessionId,
    pub content: String,
    pub role: Role,
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
}

/// Reasoning content forwarded outside the splitting logic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingUpdate {
    pub session_id: SessionId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Started,
    Progress,
    Completed,
    Failed,
}

/// One tool-invocation record for the tool sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    pub session_id: SessionId,
    pub tool_use_id: ToolUseId,
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<ToolUseId>,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub phase: ToolPhase,
}

/// Activity notifications for UI / log consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    Thinking(ThinkingUpdate),
    /// The circuit breaker refused to start a sub-task.
    SubtaskBlocked {
        session_id: SessionId,
        tool_use_id: ToolUseId,
        subagent_type: String,
        recent_failures: usize,
        message: String,
    },
    /// A running sub-task has not reported progress for a while.
    SubtaskStalled {
        session_id: SessionId,
        tool_use_id: ToolUseId,
        subagent_type: String,
        idle_ms: u64,
    },
}

impl Activity {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Thinking(t) => &t.session_id,
            Self::SubtaskBlocked { session_id, .. } | Self::SubtaskStalled { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn activity_type(&self) -> &'static str {
        match self {
            Self::Thinking(_) => "thinking",
            Self::SubtaskBlocked { .. } => "subtask_blocked",
            Self::SubtaskStalled { .. } => "subtask_stalled",
        }
    }

    /// Whether the activity represents an error state for the UI.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::SubtaskBlocked { .. })
    }
}
