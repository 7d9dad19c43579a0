//! Splits one streamed assistant response into several persisted messages at
//! tool-invocation boundaries, and links every tool record to the message it
//! belongs to.
//!
//! Text arrives as cumulative snapshots. A [`Segment`] marks where the
//! current message starts inside the accumulated text. When a tool fires and
//! the current segment already holds visible text, that segment is finalized
//! (`streaming = false`) and a new one starts at the current end of the text.
//! A tool with nothing before it never opens a new message, so consecutive
//! tools share one message id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use helm_core::events::{
    Activity, MessageUpdate, Role, ThinkingUpdate, ToolInvocationRecord, ToolPhase,
    TASK_TOOL_NAME,
};
use helm_core::provider::{ActivitySink, MessageSink, ToolSink};
use helm_core::stream::ToolUse;
use helm_core::{MessageId, SessionId, ToolUseId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::subtask::SubtaskCoordinator;

/// The message currently being streamed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: MessageId,
    /// Byte offset into the turn's accumulated text.
    pub start_offset: usize,
    pub created_at: DateTime<Utc>,
    pub was_split: bool,
}

/// LIFO of open `Task` invocations, used to attribute nested tool calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveTaskStack {
    ids: Vec<ToolUseId>,
}

impl ActiveTaskStack {
    /// Push unless already present.
    pub fn push(&mut self, id: &ToolUseId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.push(id.clone());
        true
    }

    /// Remove `id` wherever it sits (results can arrive out of order).
    pub fn remove(&mut self, id: &ToolUseId) -> bool {
        match self.ids.iter().rposition(|open| open == id) {
            Some(pos) => {
                let _ = self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn top(&self) -> Option<&ToolUseId> {
        self.ids.last()
    }

    pub fn contains(&self, id: &ToolUseId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Where splitter output goes.
#[derive(Clone)]
pub struct SplitterSinks {
    pub messages: Arc<dyn MessageSink>,
    pub tools: Arc<dyn ToolSink>,
    pub activity: Arc<dyn ActivitySink>,
}

struct ToolInfo {
    name: String,
    input: serde_json::Value,
    message_id: MessageId,
    parent: Option<ToolUseId>,
    blocked: bool,
}

const BLOCKED_TASK_ERROR: &str = "sub-task blocked by circuit breaker";

/// Per-turn splitter state.
pub struct StreamingMessageSplitter {
    session_id: SessionId,
    original_message_id: MessageId,
    original_created_at: DateTime<Utc>,
    segment: Segment,
    tasks: ActiveTaskStack,
    accumulated: String,
    tools_in_segment: usize,
    tools: HashMap<ToolUseId, ToolInfo>,
    sinks: SplitterSinks,
    subtasks: Option<Arc<SubtaskCoordinator>>,
    finalized: Vec<MessageUpdate>,
}

impl StreamingMessageSplitter {
    pub fn new(session_id: SessionId, message_id: MessageId, sinks: SplitterSinks) -> Self {
        let created_at = Utc::now();
        Self {
            session_id,
            original_message_id: message_id.clone(),
            original_created_at: created_at,
            segment: Segment {
                id: message_id,
                start_offset: 0,
                created_at,
                was_split: false,
            },
            tasks: ActiveTaskStack::default(),
            accumulated: String::new(),
            tools_in_segment: 0,
            tools: HashMap::new(),
            sinks,
            subtasks: None,
            finalized: Vec::new(),
        }
    }

    /// Route `Task` invocations through a sub-task coordinator.
    pub fn with_subtasks(mut self, subtasks: Arc<SubtaskCoordinator>) -> Self {
        self.subtasks = Some(subtasks);
        self
    }

    pub fn original_message_id(&self) -> &MessageId {
        &self.original_message_id
    }

    pub fn original_created_at(&self) -> DateTime<Utc> {
        self.original_created_at
    }

    pub fn active_tasks(&self) -> &ActiveTaskStack {
        &self.tasks
    }

    /// The segment currently open.
    pub fn final_segment(&self) -> Segment {
        self.segment.clone()
    }

    /// Every `streaming == false` update emitted so far, oldest first.
    pub fn take_finalized(&mut self) -> Vec<MessageUpdate> {
        std::mem::take(&mut self.finalized)
    }

    /// Handle a cumulative text snapshot.
    pub fn on_streaming_emit(&mut self, full_text: &str) -> Option<MessageUpdate> {
        self.accumulated.clear();
        self.accumulated.push_str(full_text);

        let content = self.segment_content();
        if self.segment.was_split && content.is_empty() {
            return None;
        }
        let update = self.message_update(content.to_owned(), true);
        self.persist(&update);
        Some(update)
    }

    /// Handle a tool invocation. Returns the record emitted for it. A repeated
    /// event for a known id changes nothing and returns the original record.
    pub fn on_tool_use(&mut self, tool_use: &ToolUse) -> ToolInvocationRecord {
        if let Some(known) = self.tools.get(&tool_use.tool_use_id) {
            debug!(
                session_id = %self.session_id,
                tool_use_id = %tool_use.tool_use_id,
                "duplicate tool use ignored"
            );
            let (phase, error) = if known.blocked {
                (ToolPhase::Failed, Some(BLOCKED_TASK_ERROR.to_owned()))
            } else {
                (ToolPhase::Started, None)
            };
            let parent = known.parent.clone();
            return self.follow_up_record(
                &tool_use.tool_use_id,
                &tool_use.tool_name,
                parent,
                None,
                error,
                phase,
            );
        }

        let is_task = tool_use.tool_name == TASK_TOOL_NAME;
        let parent = self.infer_parent(tool_use.parent_tool_use_id.as_ref(), is_task);
        let message_id = self.segment.id.clone();
        self.tools_in_segment += 1;

        let mut record = ToolInvocationRecord {
            session_id: self.session_id.clone(),
            tool_use_id: tool_use.tool_use_id.clone(),
            tool_name: tool_use.tool_name.clone(),
            input: tool_use.input.clone(),
            output: None,
            error: None,
            parent_tool_use_id: parent,
            message_id,
            timestamp: Utc::now(),
            phase: ToolPhase::Started,
        };

        let mut blocked = false;
        if is_task && self.tasks.push(&tool_use.tool_use_id) {
            if let Some(subtasks) = &self.subtasks {
                if !subtasks
                    .on_task_start(&tool_use.tool_use_id, &tool_use.input)
                    .is_allowed()
                {
                    let _ = self.tasks.remove(&tool_use.tool_use_id);
                    record.phase = ToolPhase::Failed;
                    record.error = Some(BLOCKED_TASK_ERROR.to_owned());
                    blocked = true;
                }
            }
        }
        let _ = self.tools.insert(
            tool_use.tool_use_id.clone(),
            ToolInfo {
                name: tool_use.tool_name.clone(),
                input: tool_use.input.clone(),
                message_id: record.message_id.clone(),
                parent: record.parent_tool_use_id.clone(),
                blocked,
            },
        );
        self.record_tool(&record);

        if !self.segment_content().trim().is_empty() {
            self.split();
        }
        record
    }

    /// Handle intermediate tool output. Never splits.
    pub fn on_tool_progress(
        &mut self,
        tool_use_id: &ToolUseId,
        tool_name: &str,
        content: Option<&str>,
        explicit_parent: Option<&ToolUseId>,
    ) -> ToolInvocationRecord {
        let is_task = tool_name == TASK_TOOL_NAME;
        if is_task {
            if let Some(subtasks) = &self.subtasks {
                subtasks.on_progress(tool_use_id);
            }
        }
        let parent = self.infer_parent_for(tool_use_id, explicit_parent, is_task);
        let record = self.follow_up_record(
            tool_use_id,
            tool_name,
            parent,
            content.map(str::to_owned),
            None,
            ToolPhase::Progress,
        );
        self.record_tool(&record);
        record
    }

    /// Handle a tool's final result. Never splits; a `Task` result closes the
    /// sub-task.
    pub fn on_tool_result(
        &mut self,
        tool_use_id: &ToolUseId,
        tool_name: &str,
        output: Option<&str>,
        is_error: bool,
        explicit_parent: Option<&ToolUseId>,
    ) -> ToolInvocationRecord {
        let is_task = tool_name == TASK_TOOL_NAME;
        let parent = self.infer_parent_for(tool_use_id, explicit_parent, is_task);

        if is_task {
            let _ = self.tasks.remove(tool_use_id);
            if let Some(subtasks) = &self.subtasks {
                let _ = subtasks.on_result(tool_use_id, is_error);
            }
        }

        let (output, error, phase) = if is_error {
            (None, output.map(str::to_owned), ToolPhase::Failed)
        } else {
            (output.map(str::to_owned), None, ToolPhase::Completed)
        };
        let record = self.follow_up_record(tool_use_id, tool_name, parent, output, error, phase);
        self.record_tool(&record);
        record
    }

    /// Forward reasoning text on the thinking side channel.
    pub fn on_thinking(&self, content: &str) -> ThinkingUpdate {
        let update = ThinkingUpdate {
            session_id: self.session_id.clone(),
            content: content.to_owned(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sinks.messages.thinking(&update) {
            warn!(session_id = %self.session_id, error = %e, "thinking sink failed");
        }
        if let Err(e) = self.sinks.activity.notify(&Activity::Thinking(update.clone())) {
            warn!(session_id = %self.session_id, error = %e, "activity sink failed");
        }
        update
    }

    /// Finalize the trailing segment at end of turn. Emits when it holds
    /// visible text, or when it is the original message and tools link to it.
    /// A split segment without visible text is never emitted.
    pub fn finish(&mut self) -> Option<MessageUpdate> {
        let content = self.segment_content().to_owned();
        let tool_only_original = !self.segment.was_split && self.tools_in_segment > 0;
        if content.trim().is_empty() && !tool_only_original {
            debug!(session_id = %self.session_id, message_id = %self.segment.id, "no trailing message to finalize");
            return None;
        }
        let update = self.message_update(content, false);
        self.persist(&update);
        self.finalized.push(update.clone());
        Some(update)
    }

    fn split(&mut self) {
        let content = self.segment_content().to_owned();
        let finalized = self.message_update(content, false);
        self.persist(&finalized);
        self.finalized.push(finalized.clone());

        let next = Segment {
            id: MessageId::new(),
            start_offset: self.accumulated.len(),
            created_at: Utc::now(),
            was_split: true,
        };
        debug!(
            session_id = %self.session_id,
            finalized = %finalized.id,
            next = %next.id,
            offset = next.start_offset,
            "split message at tool boundary"
        );
        self.segment = next;
        self.tools_in_segment = 0;
    }

    // Text belonging to the current segment; split segments drop leading
    // whitespace left behind by tool blocks.
    fn segment_content(&self) -> &str {
        let raw = self
            .accumulated
            .get(self.segment.start_offset..)
            .unwrap_or_default();
        if self.segment.was_split {
            raw.trim_start()
        } else {
            raw
        }
    }

    fn infer_parent(&self, explicit: Option<&ToolUseId>, is_task: bool) -> Option<ToolUseId> {
        match explicit {
            Some(parent) => Some(parent.clone()),
            None if is_task => None,
            None => self.tasks.top().cloned(),
        }
    }

    // Follow-up events keep the parent resolved when the tool started; the
    // stack is only consulted for ids never seen. A Task's own id may be on
    // top of the stack.
    fn infer_parent_for(
        &self,
        tool_use_id: &ToolUseId,
        explicit: Option<&ToolUseId>,
        is_task: bool,
    ) -> Option<ToolUseId> {
        let parent = match (explicit, self.tools.get(tool_use_id)) {
            (Some(parent), _) => Some(parent.clone()),
            (None, Some(known)) => known.parent.clone(),
            (None, None) => self.infer_parent(None, is_task),
        };
        parent.filter(|parent| parent != tool_use_id)
    }

    fn follow_up_record(
        &self,
        tool_use_id: &ToolUseId,
        tool_name: &str,
        parent: Option<ToolUseId>,
        output: Option<String>,
        error: Option<String>,
        phase: ToolPhase,
    ) -> ToolInvocationRecord {
        let known = self.tools.get(tool_use_id);
        ToolInvocationRecord {
            session_id: self.session_id.clone(),
            tool_use_id: tool_use_id.clone(),
            tool_name: known.map_or_else(|| tool_name.to_owned(), |t| t.name.clone()),
            input: known.map(|t| t.input.clone()).unwrap_or_default(),
            output,
            error,
            parent_tool_use_id: parent,
            message_id: known.map_or_else(|| self.segment.id.clone(), |t| t.message_id.clone()),
            timestamp: Utc::now(),
            phase,
        }
    }

    fn message_update(&self, content: String, streaming: bool) -> MessageUpdate {
        MessageUpdate {
            id: self.segment.id.clone(),
            session_id: self.session_id.clone(),
            content,
            role: Role::Assistant,
            streaming,
            created_at: self.segment.created_at,
        }
    }

    fn persist(&self, update: &MessageUpdate) {
        if let Err(e) = self.sinks.messages.persist(update) {
            warn!(
                session_id = %self.session_id,
                message_id = %update.id,
                streaming = update.streaming,
                error = %e,
                "message sink failed"
            );
        }
    }

    fn record_tool(&self, record: &ToolInvocationRecord) {
        if let Err(e) = self.sinks.tools.record(record) {
            warn!(
                session_id = %self.session_id,
                tool_use_id = %record.tool_use_id,
                error = %e,
                "tool sink failed"
            );
        }
    }
}
