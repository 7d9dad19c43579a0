//! # helm-core
//!
//! Foundation types shared by the helm crates: branded ids, the pure-data
//! [`context::SessionContext`], provider events, emission records, the
//! collaborator traits and the error taxonomy.

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;
pub mod stream;

pub use context::{SessionContext, SessionStatus};
pub use errors::{PipelineError, SinkError, StageError};
pub use ids::{MessageId, RunId, SessionId, ToolUseId};
