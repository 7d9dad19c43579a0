//! Per-conversation session context.
//!
//! [`SessionContext`] is a plain record. It carries no behaviour of its own;
//! the pipeline mutates it through the free functions in this module so that
//! a context can be cloned, serialized and handed between stages freely.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

/// Default capacity of the per-session audit log.
pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

/// Processing state of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Queued,
    Locked,
    ContextInjecting,
    Streaming,
    Finalizing,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Locked => "locked",
            Self::ContextInjecting => "context_injecting",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is an edge of the session state machine.
///
/// The normal path walks idle → (queued) → locked → context_injecting →
/// streaming → finalizing → complete → idle. Every state may fall into
/// `error`, and `error` only leaves through cleanup back to `idle`.
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    if to == Error {
        return true;
    }
    matches!(
        (from, to),
        (Idle, Queued)
            | (Idle, Locked)
            | (Queued, Locked)
            | (Locked, ContextInjecting)
            | (ContextInjecting, Streaming)
            | (Streaming, Finalizing)
            | (Finalizing, Complete)
            | (Complete, Idle)
            | (Error, Idle)
    )
}

/// The message a turn is currently answering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message waiting in, or leaving through, the session queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageQueue {
    pub inbound: Vec<QueuedMessage>,
    pub outbound: Vec<QueuedMessage>,
}

/// One entry of the bounded audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub kind: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Mutable per-conversation record threaded through the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(default)]
    pub current_message: Option<CurrentMessage>,
    #[serde(default)]
    pub queue: MessageQueue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<serde_json::Value>,
    #[serde(default)]
    pub events: VecDeque<AuditEvent>,
    pub audit_capacity: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Fresh idle context for a conversation seen for the first time.
pub fn new_context(session_id: SessionId, audit_capacity: usize) -> SessionContext {
    let now = Utc::now();
    SessionContext {
        session_id,
        status: SessionStatus::Idle,
        current_message: None,
        queue: MessageQueue::default(),
        context_usage: None,
        events: VecDeque::new(),
        audit_capacity: audit_capacity.max(1),
        created_at: now,
        last_activity_at: now,
    }
}

/// Append an audit event, evicting the oldest entries beyond capacity.
pub fn record_event(ctx: &mut SessionContext, kind: impl Into<String>, detail: Option<String>) {
    ctx.events.push_back(AuditEvent {
        kind: kind.into(),
        at: Utc::now(),
        detail,
    });
    while ctx.events.len() > ctx.audit_capacity {
        let _ = ctx.events.pop_front();
    }
}

/// Bump `last_activity_at` without ever moving it backwards.
pub fn touch(ctx: &mut SessionContext) {
    let now = Utc::now();
    if now > ctx.last_activity_at {
        ctx.last_activity_at = now;
    }
}

/// Move `ctx` to `to`. The status is written either way; the return value
/// says whether the move was an edge of the state machine (staying put
/// counts as one).
pub fn transition(ctx: &mut SessionContext, to: SessionStatus) -> bool {
    let legal = ctx.status == to || can_transition(ctx.status, to);
    ctx.status = to;
    legal
}

/// Audit event kinds in insertion order (oldest first).
pub fn event_kinds(ctx: &SessionContext) -> Vec<&str> {
    ctx.events.iter().map(|e| e.kind.as_str()).collect()
}
