use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::context::SessionContext;
use crate::errors::{SinkError, StageError};
use crate::events::{Activity, MessageUpdate, ThinkingUpdate, ToolInvocationRecord};
use crate::stream::ProviderEvent;

pub type ProviderEventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Push-style source of provider events for a turn.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Open the event stream answering the context's current message.
    async fn open_turn(&self, context: &SessionContext) -> Result<ProviderEventStream, StageError>;
}

/// Receives message updates. A `streaming == false` update must be persisted.
pub trait MessageSink: Send + Sync {
    fn persist(&self, update: &MessageUpdate) -> Result<(), SinkError>;

    fn thinking(&self, _update: &ThinkingUpdate) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Receives tool-invocation records.
pub trait ToolSink: Send + Sync {
    fn record(&self, record: &ToolInvocationRecord) -> Result<(), SinkError>;
}

/// Receives activity / notification events (blocked, stalled, thinking).
pub trait ActivitySink: Send + Sync {
    fn notify(&self, activity: &Activity) -> Result<(), SinkError>;
}

/// Optional enrichment applied by the context-injection stage.
#[async_trait]
pub trait ContextInjector: Send + Sync {
    async fn inject(&self, context: &mut SessionContext) -> Result<(), StageError>;
}

/// Sink that drops everything. Useful when a collaborator is not wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn persist(&self, _update: &MessageUpdate) -> Result<(), SinkError> {
        Ok(())
    }
}

impl ToolSink for NullSink {
    fn record(&self, _record: &ToolInvocationRecord) -> Result<(), SinkError> {
        Ok(())
    }
}

impl ActivitySink for NullSink {
    fn notify(&self, _activity: &Activity) -> Result<(), SinkError> {
        Ok(())
    }
}
