//! Ordered stage execution for one conversation turn.
//!
//! A turn takes the session lock, walks every stage in order under a
//! per-stage deadline, writes the context back to the store after each stage
//! and releases the lock. Any failure marks the session `error`, clears it in
//! the [`ConcurrencyManager`] (rejecting queued callers) and is returned to
//! the caller unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use helm_core::context::{
    record_event, touch, transition, QueuedMessage, SessionContext, SessionStatus,
};
use helm_core::provider::{
    ActivitySink, ContextInjector, MessageSink, NullSink, ProviderGateway, ToolSink,
};
use helm_core::{MessageId, PipelineError, RunId, SessionId, StageError};
use helm_settings::{HelmSettings, PipelineSettings};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::circuit::SubagentCircuitBreaker;
use crate::concurrency::{ConcurrencyManager, MessageDescriptor, SessionLease};
use crate::splitter::SplitterSinks;
use crate::store::SessionContextStore;
use crate::subtask::SubtaskConfig;

/// External collaborators a turn talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn ProviderGateway>,
    pub messages: Arc<dyn MessageSink>,
    pub tools: Arc<dyn ToolSink>,
    pub activity: Arc<dyn ActivitySink>,
    pub breaker: Arc<SubagentCircuitBreaker>,
    pub injector: Option<Arc<dyn ContextInjector>>,
    pub subtasks: SubtaskConfig,
}

impl Collaborators {
    /// Collaborators with every sink discarding its input.
    pub fn new(gateway: Arc<dyn ProviderGateway>, breaker: Arc<SubagentCircuitBreaker>) -> Self {
        Self {
            gateway,
            messages: Arc::new(NullSink),
            tools: Arc::new(NullSink),
            activity: Arc::new(NullSink),
            breaker,
            injector: None,
            subtasks: SubtaskConfig::default(),
        }
    }

    pub fn with_sinks(mut self, sinks: SplitterSinks) -> Self {
        self.messages = sinks.messages;
        self.tools = sinks.tools;
        self.activity = sinks.activity;
        self
    }

    pub fn with_injector(mut self, injector: Arc<dyn ContextInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_subtasks(mut self, config: SubtaskConfig) -> Self {
        self.subtasks = config;
        self
    }

    pub fn splitter_sinks(&self) -> SplitterSinks {
        SplitterSinks {
            messages: Arc::clone(&self.messages),
            tools: Arc::clone(&self.tools),
            activity: Arc::clone(&self.activity),
        }
    }
}

/// What a stage gets besides the context.
#[derive(Clone)]
pub struct StageScope {
    pub session_id: SessionId,
    /// The inbound message this turn answers.
    pub message_id: MessageId,
    /// Cancelled on deadline or abort, and when the turn is dropped. Stages
    /// must poll it.
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub collaborators: Arc<Collaborators>,
}

impl StageScope {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// `Err(Cancelled)` once the token fires.
    pub fn check(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One named step of a turn.
///
/// A stage receives the context by value and returns the next version. It
/// must not change `session_id`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Stage-specific deadline. Settings overrides win over this.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, context: SessionContext, scope: StageScope)
        -> Result<SessionContext, StageError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub default_stage_timeout: Duration,
    pub stage_timeouts: HashMap<String, Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            default_stage_timeout: Duration::from_millis(settings.default_stage_timeout_ms),
            stage_timeouts: settings
                .stage_timeouts_ms
                .iter()
                .map(|(stage, ms)| (stage.clone(), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Settings override, then the stage's own timeout, then the default.
    pub fn timeout_for(&self, stage: &dyn Stage) -> Duration {
        self.stage_timeouts
            .get(stage.name())
            .copied()
            .or_else(|| stage.timeout())
            .unwrap_or(self.default_stage_timeout)
    }
}

/// Runs turns for every session in the process.
pub struct MessagePipeline {
    stages: Vec<Arc<dyn Stage>>,
    config: PipelineConfig,
    locks: Arc<ConcurrencyManager>,
    store: Arc<SessionContextStore>,
    active: DashMap<SessionId, ActiveRun>,
}

impl MessagePipeline {
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        config: PipelineConfig,
        locks: Arc<ConcurrencyManager>,
        store: Arc<SessionContextStore>,
    ) -> Self {
        Self {
            stages,
            config,
            locks,
            store,
            active: DashMap::new(),
        }
    }

    /// Default three-stage pipeline (injection, streaming, finalization)
    /// with fresh lock table and store sized from settings.
    pub fn from_settings(settings: &HelmSettings) -> Self {
        Self::new(
            crate::stages::default_stages(),
            PipelineConfig::from(&settings.pipeline),
            Arc::new(ConcurrencyManager::new()),
            Arc::new(SessionContextStore::new(settings.session.audit_log_capacity)),
        )
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<ConcurrencyManager> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<SessionContextStore> {
        &self.store
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    /// Cancel the running turn of `session_id`. Returns whether one was running.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn abort(&self, session_id: &SessionId) -> bool {
        match self.active.get(session_id) {
            Some(run) => {
                warn!(run_id = %run.run_id, "abort requested");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Queue `content` as a new inbound message and run a turn for it.
    pub async fn submit(
        &self,
        session_id: &SessionId,
        content: impl Into<String>,
        collaborators: Arc<Collaborators>,
    ) -> Result<SessionContext, PipelineError> {
        let mut context = self.store.get_or_create(session_id);
        context.queue.inbound.push(QueuedMessage {
            id: MessageId::new(),
            content: content.into(),
            created_at: Utc::now(),
        });
        self.execute(context, collaborators).await
    }

    /// Run one turn. The turn answers the newest inbound message of
    /// `context` (or its current message when nothing is queued).
    #[instrument(skip_all, fields(session_id = %context.session_id))]
    pub async fn execute(
        &self,
        context: SessionContext,
        collaborators: Arc<Collaborators>,
    ) -> Result<SessionContext, PipelineError> {
        let session_id = context.session_id.clone();
        let message_id = turn_message_id(&context);

        let acquisition = self
            .locks
            .acquire_lock(&session_id, MessageDescriptor::new(message_id.clone()));
        let lease = SessionLease::new(Arc::clone(&self.locks), session_id.clone(), acquisition.ticket);
        let waited = !acquisition.acquired;
        let mut context = context;
        if waited {
            // Detached caller copy; the stored one belongs to the running turn.
            context.status = SessionStatus::Queued;
            debug!(
                message_id = %message_id,
                queue_depth = self.locks.queue_depth(&session_id),
                "waiting for session lock"
            );
        }
        let queued_at = Instant::now();
        if let Err(e) = acquisition.wait.wait().await {
            drop(lease);
            counter!("pipeline_runs_total", "outcome" => "rejected").increment(1);
            info!(error = %e, "queued turn rejected");
            return Err(e);
        }

        let mut context = self.rebase(context, &message_id);
        if context.status == SessionStatus::Error {
            set_status(&mut context, SessionStatus::Idle);
            record_event(&mut context, "session:recovered", None);
        }
        if waited {
            record_event(
                &mut context,
                "lock:waited",
                Some(format!("{}ms", queued_at.elapsed().as_millis())),
            );
        }
        set_status(&mut context, SessionStatus::Locked);
        record_event(&mut context, "lock:acquired", Some(message_id.to_string()));
        self.store.put(context.clone());

        let mut turn = TurnGuard::begin(self, session_id, lease);
        self.run_stages(context, message_id, &mut turn, collaborators).await
    }

    async fn run_stages(
        &self,
        mut context: SessionContext,
        message_id: MessageId,
        turn: &mut TurnGuard<'_>,
        collaborators: Arc<Collaborators>,
    ) -> Result<SessionContext, PipelineError> {
        let run_token = turn.cancel.clone();
        let session_id = context.session_id.clone();
        record_event(&mut context, "pipeline:start", None);
        info!(stages = self.stages.len(), "pipeline started");

        for stage in &self.stages {
            let name = stage.name().to_owned();
            record_event(&mut context, format!("stage:{name}:start"), None);
            let snapshot = context.clone();

            let timeout = self.config.timeout_for(stage.as_ref());
            let cancel = run_token.child_token();
            let scope = StageScope {
                session_id: session_id.clone(),
                message_id: message_id.clone(),
                cancel: cancel.clone(),
                deadline: Instant::now() + timeout,
                collaborators: Arc::clone(&collaborators),
            };

            let started = Instant::now();
            let task = {
                let stage = Arc::clone(stage);
                tokio::spawn(async move { stage.run(context, scope).await })
            };
            let outcome = tokio::select! {
                joined = task => match joined {
                    Ok(Ok(next)) => Ok(next),
                    Ok(Err(e)) => Err(PipelineError::from_stage(&name, e)),
                    Err(join_err) => Err(PipelineError::StageExecution {
                        stage: name.clone(),
                        message: if join_err.is_panic() {
                            "stage panicked".to_owned()
                        } else {
                            join_err.to_string()
                        },
                    }),
                },
                () = tokio::time::sleep(timeout) => {
                    cancel.cancel();
                    counter!("pipeline_stage_timeouts_total", "stage" => name.clone()).increment(1);
                    Err(PipelineError::StageTimeout { stage: name.clone(), timeout })
                }
                () = run_token.cancelled() => {
                    Err(PipelineError::Cancelled { stage: name.clone() })
                }
            };
            histogram!("pipeline_stage_duration_seconds", "stage" => name.clone())
                .record(started.elapsed().as_secs_f64());

            let next = match outcome {
                Ok(next) if next.session_id != session_id => {
                    return Err(self.fail(
                        snapshot,
                        turn.settle(),
                        PipelineError::StageContractViolation { stage: name },
                    ));
                }
                Ok(next) => next,
                Err(e) => return Err(self.fail(snapshot, turn.settle(), e)),
            };

            context = next;
            touch(&mut context);
            record_event(&mut context, format!("stage:{name}:complete"), None);
            self.store.put(context.clone());
            debug!(stage = %name, elapsed_ms = started.elapsed().as_millis() as u64, "stage complete");
        }

        set_status(&mut context, SessionStatus::Complete);
        record_event(&mut context, "pipeline:complete", None);
        self.store.put(context.clone());
        if let Some(lease) = turn.settle() {
            lease.release();
        }

        set_status(&mut context, SessionStatus::Idle);
        // A promoted waiter may already own the stored copy.
        let _ = self.store.update(&session_id, |stored| {
            if stored.status == SessionStatus::Complete {
                stored.status = SessionStatus::Idle;
            }
        });
        counter!("pipeline_runs_total", "outcome" => "success").increment(1);
        info!("pipeline complete");
        Ok(context)
    }

    fn fail(
        &self,
        mut context: SessionContext,
        lease: Option<SessionLease>,
        err: PipelineError,
    ) -> PipelineError {
        error!(
            stage = err.stage().unwrap_or("-"),
            kind = err.error_kind(),
            error = %err,
            "pipeline failed"
        );
        record_event(&mut context, "pipeline:error", Some(err.to_string()));
        set_status(&mut context, SessionStatus::Error);
        touch(&mut context);
        self.store.put(context);

        let rejected = lease.map_or(0, |lease| lease.fail(&err.to_string()));
        if rejected > 0 {
            warn!(rejected, "rejected queued turns after failure");
        }
        counter!("pipeline_runs_total", "outcome" => "error").increment(1);
        err
    }

    // The store copy is authoritative once it exists; the caller contributes
    // only the message this turn answers.
    fn rebase(&self, caller: SessionContext, message_id: &MessageId) -> SessionContext {
        let Some(mut base) = self.store.get(&caller.session_id) else {
            return caller;
        };
        let already_queued = base.queue.inbound.iter().any(|m| &m.id == message_id);
        if !already_queued {
            if let Some(message) = caller.queue.inbound.into_iter().find(|m| &m.id == message_id) {
                base.queue.inbound.push(message);
            } else if base.current_message.is_none() {
                base.current_message = caller.current_message;
            }
        }
        base
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

// Owns the lease and the active-run entry of a turn in progress. Dropping it
// before `settle` (the caller dropped the turn future) cancels the running
// stage, marks the stored context `error` and clears the session.
struct TurnGuard<'a> {
    pipeline: &'a MessagePipeline,
    session_id: SessionId,
    run_id: RunId,
    cancel: CancellationToken,
    lease: Option<SessionLease>,
}

impl<'a> TurnGuard<'a> {
    fn begin(pipeline: &'a MessagePipeline, session_id: SessionId, lease: SessionLease) -> Self {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let _ = pipeline.active.insert(
            session_id.clone(),
            ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            },
        );
        Self {
            pipeline,
            session_id,
            run_id,
            cancel,
            lease: Some(lease),
        }
    }

    /// Hand the lease back for the final release or failure path.
    fn settle(&mut self) -> Option<SessionLease> {
        self.lease.take()
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .pipeline
            .active
            .remove_if(&self.session_id, |_, run| run.run_id == self.run_id);
        let Some(lease) = self.lease.take() else {
            return;
        };

        self.cancel.cancel();
        let reason = "turn dropped before completion";
        warn!(session_id = %self.session_id, run_id = %self.run_id, "turn dropped before completion");
        let _ = self.pipeline.store.update(&self.session_id, |ctx| {
            record_event(ctx, "pipeline:error", Some(reason.to_owned()));
            set_status(ctx, SessionStatus::Error);
            touch(ctx);
        });
        let _ = lease.fail(reason);
        counter!("pipeline_runs_total", "outcome" => "dropped").increment(1);
    }
}

/// Set the session status, warning when the move leaves the state machine.
pub(crate) fn set_status(context: &mut SessionContext, to: SessionStatus) {
    let from = context.status;
    if !transition(context, to) {
        warn!(session_id = %context.session_id, %from, %to, "status change outside the session state machine");
    }
}

fn turn_message_id(context: &SessionContext) -> MessageId {
    context
        .queue
        .inbound
        .last()
        .map(|m| m.id.clone())
        .or_else(|| context.current_message.as_ref().map(|m| m.id.clone()))
        .unwrap_or_default()
}
