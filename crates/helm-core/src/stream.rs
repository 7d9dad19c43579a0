use serde::{Deserialize, Serialize};

use crate::ids::ToolUseId;

/// Raw provider events for one turn, as delivered by the transport.
///
/// Text arrives as cumulative snapshots: every `TextSnapshot` carries the
/// full assistant text accumulated so far in the turn, not a delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    TextSnapshot {
        text: String,
    },
    ToolUse(ToolUse),
    ToolProgress {
        tool_use_id: ToolUseId,
        tool_name: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        parent_tool_use_id: Option<ToolUseId>,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        tool_name: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        parent_tool_use_id: Option<ToolUseId>,
    },
    Thinking {
        content: String,
    },
    Done,
    Error {
        message: String,
    },
}

/// A tool invocation as announced by the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_use_id: ToolUseId,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub parent_tool_use_id: Option<ToolUseId>,
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextSnapshot { .. } => "text_snapshot",
            Self::ToolUse(_) => "tool_use",
            Self::ToolProgress { .. } => "tool_progress",
            Self::ToolResult { .. } => "tool_result",
            Self::Thinking { .. } => "thinking",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}
