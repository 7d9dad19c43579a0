//! Scripted gateway and recording sinks for deterministic turns without a
//! live provider or persistence layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use helm_core::context::SessionContext;
use helm_core::errors::{SinkError, StageError};
use helm_core::events::{Activity, MessageUpdate, ThinkingUpdate, ToolInvocationRecord};
use helm_core::provider::{ActivitySink, MessageSink, ProviderEventStream, ProviderGateway, ToolSink};
use helm_core::stream::ProviderEvent;
use parking_lot::Mutex;

use crate::splitter::SplitterSinks;

/// One pre-programmed provider turn.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Yield the events back to back.
    Events(Vec<ProviderEvent>),
    /// Sleep before each event.
    Paced(Duration, Vec<ProviderEvent>),
    /// Fail `open_turn` itself.
    Error(StageError),
    /// Wait, then resolve the inner turn.
    Delay(Duration, Box<ScriptedTurn>),
}

impl ScriptedTurn {
    /// Text snapshots for `text`, then `Done`.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![
            ProviderEvent::TextSnapshot {
                text: text.to_owned(),
            },
            ProviderEvent::Done,
        ])
    }

    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Gateway returning scripted turns in order.
pub struct ScriptedGateway {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    call_count: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_turn(&self, _context: &SessionContext) -> Result<ProviderEventStream, StageError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(mut turn) = self.turns.lock().pop_front() else {
            return Err(StageError::Gateway(format!(
                "ScriptedGateway: no turn configured for call {idx}"
            )));
        };
        loop {
            match turn {
                ScriptedTurn::Events(events) => return Ok(Box::pin(stream::iter(events))),
                ScriptedTurn::Paced(gap, events) => {
                    let paced = stream::iter(events).then(move |event| async move {
                        tokio::time::sleep(gap).await;
                        event
                    });
                    return Ok(Box::pin(paced));
                }
                ScriptedTurn::Error(e) => return Err(e),
                ScriptedTurn::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    turn = *inner;
                }
            }
        }
    }
}

#[derive(Default)]
struct Recorded {
    messages: Vec<MessageUpdate>,
    thinking: Vec<ThinkingUpdate>,
    tools: Vec<ToolInvocationRecord>,
    activities: Vec<Activity>,
}

/// Sinks that keep everything they receive. A disconnected instance rejects
/// every call with [`SinkError::Disconnected`] after recording it.
#[derive(Clone, Default)]
pub struct RecordingSinks {
    recorded: Arc<Mutex<Recorded>>,
    disconnected: bool,
}

impl RecordingSinks {
    pub fn disconnected() -> Self {
        Self {
            recorded: Arc::default(),
            disconnected: true,
        }
    }

    pub fn message_sink(&self) -> Arc<dyn MessageSink> {
        Arc::new(self.clone())
    }

    pub fn tool_sink(&self) -> Arc<dyn ToolSink> {
        Arc::new(self.clone())
    }

    pub fn activity_sink(&self) -> Arc<dyn ActivitySink> {
        Arc::new(self.clone())
    }

    pub fn splitter_sinks(&self) -> SplitterSinks {
        SplitterSinks {
            messages: self.message_sink(),
            tools: self.tool_sink(),
            activity: self.activity_sink(),
        }
    }

    pub fn messages(&self) -> Vec<MessageUpdate> {
        self.recorded.lock().messages.clone()
    }

    /// Only the `streaming == false` updates, in order.
    pub fn finalized(&self) -> Vec<MessageUpdate> {
        self.recorded
            .lock()
            .messages
            .iter()
            .filter(|m| !m.streaming)
            .cloned()
            .collect()
    }

    pub fn thinking(&self) -> Vec<ThinkingUpdate> {
        self.recorded.lock().thinking.clone()
    }

    pub fn tools(&self) -> Vec<ToolInvocationRecord> {
        self.recorded.lock().tools.clone()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.recorded.lock().activities.clone()
    }

    fn outcome(&self) -> Result<(), SinkError> {
        if self.disconnected {
            Err(SinkError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl MessageSink for RecordingSinks {
    fn persist(&self, update: &MessageUpdate) -> Result<(), SinkError> {
        self.recorded.lock().messages.push(update.clone());
        self.outcome()
    }

    fn thinking(&self, update: &ThinkingUpdate) -> Result<(), SinkError> {
        self.recorded.lock().thinking.push(update.clone());
        self.outcome()
    }
}

impl ToolSink for RecordingSinks {
    fn record(&self, record: &ToolInvocationRecord) -> Result<(), SinkError> {
        self.recorded.lock().tools.push(record.clone());
        self.outcome()
    }
}

impl ActivitySink for RecordingSinks {
    fn notify(&self, activity: &Activity) -> Result<(), SinkError> {
        self.recorded.lock().activities.push(activity.clone());
        self.outcome()
    }
}
