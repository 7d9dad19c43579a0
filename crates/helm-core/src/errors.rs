use std::time::Duration;

use crate::ids::SessionId;

/// Error returned by a single pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("provider error: {0}")]
    Gateway(String),
}

/// Errors surfaced by a pipeline run. Any of these aborts the turn.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} timed out after {}ms", timeout.as_millis())]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Stage {stage} corrupted sessionId")]
    StageContractViolation { stage: String },

    #[error("Stage {stage} failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error("Stage {stage} was cancelled")]
    Cancelled { stage: String },

    #[error("session {session_id} was cleared while messages were pending: {reason}")]
    SessionCleared { session_id: SessionId, reason: String },
}

impl PipelineError {
    /// Wrap a stage's own error with the stage name.
    pub fn from_stage(stage: &str, err: StageError) -> Self {
        match err {
            StageError::Cancelled => Self::Cancelled {
                stage: stage.to_owned(),
            },
            other => Self::StageExecution {
                stage: stage.to_owned(),
                message: other.to_string(),
            },
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::StageTimeout { .. } => "stage_timeout",
            Self::StageContractViolation { .. } => "stage_contract_violation",
            Self::StageExecution { .. } => "stage_execution",
            Self::Cancelled { .. } => "cancelled",
            Self::SessionCleared { .. } => "session_cleared",
        }
    }

    /// Name of the stage that failed, when the failure came from one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageTimeout { stage, .. }
            | Self::StageContractViolation { stage }
            | Self::StageExecution { stage, .. }
            | Self::Cancelled { stage } => Some(stage),
            Self::SessionCleared { .. } => None,
        }
    }
}

/// A collaborator sink could not accept a record.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink disconnected")]
    Disconnected,
    #[error("sink rejected record: {0}")]
    Rejected(String),
}
