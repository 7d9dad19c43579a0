//! Built-in turn stages: context injection, streaming, finalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use helm_core::context::{record_event, CurrentMessage, QueuedMessage, SessionContext, SessionStatus};
use helm_core::provider::ProviderEventStream;
use helm_core::stream::ProviderEvent;
use helm_core::{MessageId, StageError};
use tracing::{debug, warn};

use crate::pipeline::{set_status, Stage, StageScope};
use crate::splitter::StreamingMessageSplitter;
use crate::subtask::SubtaskCoordinator;

pub const CONTEXT_INJECTION: &str = "context_injection";
pub const STREAMING: &str = "streaming";
pub const FINALIZATION: &str = "finalization";

/// Injection, streaming, finalization.
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(ContextInjectionStage),
        Arc::new(StreamingStage::default()),
        Arc::new(FinalizationStage),
    ]
}

/// Moves the turn's message out of the inbound queue into
/// `current_message` and runs the optional [`ContextInjector`].
///
/// [`ContextInjector`]: helm_core::provider::ContextInjector
pub struct ContextInjectionStage;

#[async_trait]
impl Stage for ContextInjectionStage {
    fn name(&self) -> &str {
        CONTEXT_INJECTION
    }

    async fn run(
        &self,
        mut context: SessionContext,
        scope: StageScope,
    ) -> Result<SessionContext, StageError> {
        scope.check()?;
        set_status(&mut context, SessionStatus::ContextInjecting);

        let position = context
            .queue
            .inbound
            .iter()
            .position(|m| m.id == scope.message_id);
        match position {
            Some(pos) => {
                let message = context.queue.inbound.remove(pos);
                context.current_message = Some(CurrentMessage {
                    id: message.id,
                    content: message.content,
                    created_at: message.created_at,
                });
            }
            None if context
                .current_message
                .as_ref()
                .is_some_and(|m| m.id == scope.message_id) => {}
            None => {
                return Err(StageError::Failed(format!(
                    "message {} is not queued",
                    scope.message_id
                )));
            }
        }

        if let Some(injector) = scope.collaborators.injector.clone() {
            tokio::select! {
                injected = injector.inject(&mut context) => injected?,
                () = scope.cancel.cancelled() => return Err(StageError::Cancelled),
            }
        }
        record_event(&mut context, "context:injected", Some(scope.message_id.to_string()));
        Ok(context)
    }
}

/// Drives the provider stream through a [`StreamingMessageSplitter`] and
/// appends the finalized assistant messages to the outbound queue.
#[derive(Default)]
pub struct StreamingStage {
    timeout: Option<Duration>,
}

impl StreamingStage {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl Stage for StreamingStage {
    fn name(&self) -> &str {
        STREAMING
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(
        &self,
        mut context: SessionContext,
        scope: StageScope,
    ) -> Result<SessionContext, StageError> {
        scope.check()?;
        set_status(&mut context, SessionStatus::Streaming);
        let collaborators = Arc::clone(&scope.collaborators);

        let mut stream = tokio::select! {
            biased;
            () = scope.cancel.cancelled() => return Err(StageError::Cancelled),
            opened = collaborators.gateway.open_turn(&context) => opened?,
        };

        let coordinator = Arc::new(SubtaskCoordinator::new(
            scope.session_id.clone(),
            Arc::clone(&collaborators.breaker),
            Arc::clone(&collaborators.activity),
            collaborators.subtasks.clone(),
        ));
        let mut splitter = StreamingMessageSplitter::new(
            scope.session_id.clone(),
            MessageId::new(),
            collaborators.splitter_sinks(),
        )
        .with_subtasks(Arc::clone(&coordinator));

        let driven = drive(&mut stream, &mut splitter, &scope).await;
        coordinator.cancel_all();
        driven?;

        let _ = splitter.finish();
        let finalized = splitter.take_finalized();
        record_event(
            &mut context,
            "stream:complete",
            Some(format!("{} message(s)", finalized.len())),
        );
        context
            .queue
            .outbound
            .extend(finalized.into_iter().map(|m| QueuedMessage {
                id: m.id,
                content: m.content,
                created_at: m.created_at,
            }));
        Ok(context)
    }
}

async fn drive(
    stream: &mut ProviderEventStream,
    splitter: &mut StreamingMessageSplitter,
    scope: &StageScope,
) -> Result<(), StageError> {
    loop {
        let next = tokio::select! {
            biased;
            () = scope.cancel.cancelled() => return Err(StageError::Cancelled),
            next = stream.next() => next,
        };
        let Some(event) = next else {
            warn!(session_id = %scope.session_id, "provider stream ended without done");
            return Ok(());
        };
        match event {
            ProviderEvent::TextSnapshot { text } => {
                let _ = splitter.on_streaming_emit(&text);
            }
            ProviderEvent::ToolUse(tool_use) => {
                let _ = splitter.on_tool_use(&tool_use);
            }
            ProviderEvent::ToolProgress {
                tool_use_id,
                tool_name,
                content,
                parent_tool_use_id,
            } => {
                let _ = splitter.on_tool_progress(
                    &tool_use_id,
                    &tool_name,
                    content.as_deref(),
                    parent_tool_use_id.as_ref(),
                );
            }
            ProviderEvent::ToolResult {
                tool_use_id,
                tool_name,
                output,
                is_error,
                parent_tool_use_id,
            } => {
                let _ = splitter.on_tool_result(
                    &tool_use_id,
                    &tool_name,
                    output.as_deref(),
                    is_error,
                    parent_tool_use_id.as_ref(),
                );
            }
            ProviderEvent::Thinking { content } => {
                let _ = splitter.on_thinking(&content);
            }
            ProviderEvent::Done => {
                debug!(session_id = %scope.session_id, "provider stream done");
                return Ok(());
            }
            ProviderEvent::Error { message } => return Err(StageError::Gateway(message)),
        }
    }
}

/// Marks the turn as finalizing once every reply has been persisted.
pub struct FinalizationStage;

#[async_trait]
impl Stage for FinalizationStage {
    fn name(&self) -> &str {
        FINALIZATION
    }

    async fn run(
        &self,
        mut context: SessionContext,
        scope: StageScope,
    ) -> Result<SessionContext, StageError> {
        scope.check()?;
        set_status(&mut context, SessionStatus::Finalizing);
        let answered = context.current_message.take().map(|m| m.id.to_string());
        record_event(&mut context, "turn:finalized", answered);
        Ok(context)
    }
}
