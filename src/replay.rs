//! Replay scripts and the JSON-lines sinks used by `helm replay`.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use helm_core::errors::SinkError;
use helm_core::events::{Activity, MessageUpdate, ThinkingUpdate, ToolInvocationRecord};
use helm_core::provider::{ActivitySink, MessageSink, ToolSink};
use helm_core::stream::ProviderEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One scripted turn: the user message to submit and the provider events
/// that answer it.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplayTurn {
    #[serde(default)]
    pub message: Option<String>,
    pub events: Vec<ProviderEvent>,
}

/// A replay file is either a bare event array (a single turn) or
/// `{"turns": [...]}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ReplayScript {
    Single(Vec<ProviderEvent>),
    Turns { turns: Vec<ReplayTurn> },
}

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay script {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse replay script {}", path.display()))
    }

    pub fn into_turns(self) -> Vec<ReplayTurn> {
        match self {
            Self::Single(events) => vec![ReplayTurn {
                message: None,
                events,
            }],
            Self::Turns { turns } => turns,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OutputLine<'a> {
    Message(&'a MessageUpdate),
    Thinking(&'a ThinkingUpdate),
    Tool(&'a ToolInvocationRecord),
    Activity(&'a Activity),
    Context(&'a helm_core::SessionContext),
}

/// Writes every emission as one JSON object per line.
pub struct JsonLines<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLines<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn emit(&self, line: &OutputLine<'_>) -> Result<(), SinkError> {
        let encoded = serde_json::to_string(line).map_err(|e| SinkError::Rejected(e.to_string()))?;
        let mut out = self.out.lock();
        writeln!(out, "{encoded}").map_err(|_| SinkError::Disconnected)?;
        out.flush().map_err(|_| SinkError::Disconnected)
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> MessageSink for JsonLines<W> {
    fn persist(&self, update: &MessageUpdate) -> Result<(), SinkError> {
        self.emit(&OutputLine::Message(update))
    }

    fn thinking(&self, update: &ThinkingUpdate) -> Result<(), SinkError> {
        self.emit(&OutputLine::Thinking(update))
    }
}

impl<W: Write + Send> ToolSink for JsonLines<W> {
    fn record(&self, record: &ToolInvocationRecord) -> Result<(), SinkError> {
        self.emit(&OutputLine::Tool(record))
    }
}

impl<W: Write + Send> ActivitySink for JsonLines<W> {
    fn notify(&self, activity: &Activity) -> Result<(), SinkError> {
        self.emit(&OutputLine::Activity(activity))
    }
}
