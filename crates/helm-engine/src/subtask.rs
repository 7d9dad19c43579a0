//! Sub-task (`Task` tool) lifecycle: admission through the circuit breaker,
//! progress tracking, stall detection and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use helm_core::events::Activity;
use helm_core::provider::ActivitySink;
use helm_core::{SessionId, ToolUseId};
use helm_settings::SubtaskSettings;
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit::SubagentCircuitBreaker;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubtaskConfig {
    pub stall_timeout: Duration,
    pub default_subagent_type: String,
}

impl Default for SubtaskConfig {
    fn default() -> Self {
        Self::from(&SubtaskSettings::default())
    }
}

impl From<&SubtaskSettings> for SubtaskConfig {
    fn from(settings: &SubtaskSettings) -> Self {
        Self {
            stall_timeout: Duration::from_millis(settings.stall_timeout_ms.max(1)),
            default_subagent_type: settings.default_subagent_type.clone(),
        }
    }
}

/// Outcome of asking to start a sub-task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskAdmission {
    Allowed,
    Blocked { recent_failures: usize },
}

impl TaskAdmission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressMetrics {
    pub started_at: Instant,
    pub last_progress_at: Instant,
    pub progress_events: u64,
}

struct TrackedTask {
    subagent_type: String,
    metrics: Arc<Mutex<ProgressMetrics>>,
    stall_watch: CancellationToken,
}

/// Per-turn registry of running sub-tasks.
pub struct SubtaskCoordinator {
    session_id: SessionId,
    breaker: Arc<SubagentCircuitBreaker>,
    activity: Arc<dyn ActivitySink>,
    config: SubtaskConfig,
    tasks: Mutex<HashMap<ToolUseId, TrackedTask>>,
    shutdown: CancellationToken,
}

impl SubtaskCoordinator {
    pub fn new(
        session_id: SessionId,
        breaker: Arc<SubagentCircuitBreaker>,
        activity: Arc<dyn ActivitySink>,
        config: SubtaskConfig,
    ) -> Self {
        Self {
            session_id,
            breaker,
            activity,
            config,
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// `subagent_type` named in a `Task` input, or the configured default.
    pub fn subagent_type_of(&self, input: &serde_json::Value) -> String {
        input
            .get("subagent_type")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.default_subagent_type)
            .to_owned()
    }

    /// Gate a new sub-task. A blocked start counts as a failure of its type
    /// and raises a `SubtaskBlocked` activity; nothing is tracked for it.
    pub fn on_task_start(&self, tool_use_id: &ToolUseId, input: &serde_json::Value) -> TaskAdmission {
        let subagent_type = self.subagent_type_of(input);

        if !self.breaker.should_allow(&subagent_type) {
            let recent_failures = self.breaker.recent_failures(&subagent_type);
            counter!("subtask_blocked_total").increment(1);
            let window_mins = self.breaker.config().window.as_secs() / 60;
            self.notify(&Activity::SubtaskBlocked {
                session_id: self.session_id.clone(),
                tool_use_id: tool_use_id.clone(),
                subagent_type: subagent_type.clone(),
                recent_failures,
                message: format!(
                    "Sub-task type '{subagent_type}' is temporarily blocked after \
                     {recent_failures} failures in the last {window_mins} minutes"
                ),
            });
            self.breaker.record_failure(&subagent_type);
            return TaskAdmission::Blocked { recent_failures };
        }

        let now = Instant::now();
        let metrics = Arc::new(Mutex::new(ProgressMetrics {
            started_at: now,
            last_progress_at: now,
            progress_events: 0,
        }));
        let stall_watch = self.shutdown.child_token();
        self.spawn_stall_watch(tool_use_id, &subagent_type, &metrics, &stall_watch);

        let previous = self.tasks.lock().insert(
            tool_use_id.clone(),
            TrackedTask {
                subagent_type: subagent_type.clone(),
                metrics,
                stall_watch,
            },
        );
        if let Some(previous) = previous {
            previous.stall_watch.cancel();
        }
        debug!(session_id = %self.session_id, tool_use_id = %tool_use_id, subagent_type = %subagent_type, "sub-task started");
        TaskAdmission::Allowed
    }

    /// Refresh the progress clock. Unknown ids are ignored.
    pub fn on_progress(&self, tool_use_id: &ToolUseId) {
        if let Some(task) = self.tasks.lock().get(tool_use_id) {
            let mut metrics = task.metrics.lock();
            metrics.last_progress_at = Instant::now();
            metrics.progress_events += 1;
        }
    }

    /// Settle a sub-task: feed the breaker, stop its stall watch and drop its
    /// metrics. A second call for the same id is a no-op returning `false`.
    pub fn on_result(&self, tool_use_id: &ToolUseId, is_error: bool) -> bool {
        let Some(task) = self.tasks.lock().remove(tool_use_id) else {
            debug!(tool_use_id = %tool_use_id, "sub-task already cleaned up");
            return false;
        };
        task.stall_watch.cancel();
        if is_error {
            self.breaker.record_failure(&task.subagent_type);
        } else {
            self.breaker.record_success(&task.subagent_type);
        }
        info!(
            session_id = %self.session_id,
            tool_use_id = %tool_use_id,
            subagent_type = %task.subagent_type,
            is_error,
            "sub-task finished"
        );
        true
    }

    /// Stop every stall watch and forget all tracked sub-tasks. The breaker
    /// is left untouched.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (_, task) in &drained {
            task.stall_watch.cancel();
        }
        if !drained.is_empty() {
            debug!(session_id = %self.session_id, count = drained.len(), "cancelled sub-task tracking");
        }
    }

    pub fn is_tracking(&self, tool_use_id: &ToolUseId) -> bool {
        self.tasks.lock().contains_key(tool_use_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn progress(&self, tool_use_id: &ToolUseId) -> Option<ProgressMetrics> {
        self.tasks.lock().get(tool_use_id).map(|t| *t.metrics.lock())
    }

    fn notify(&self, activity: &Activity) {
        if let Err(e) = self.activity.notify(activity) {
            warn!(
                session_id = %self.session_id,
                activity = activity.activity_type(),
                error = %e,
                "activity sink failed"
            );
        }
    }

    fn spawn_stall_watch(
        &self,
        tool_use_id: &ToolUseId,
        subagent_type: &str,
        metrics: &Arc<Mutex<ProgressMetrics>>,
        cancel: &CancellationToken,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(tool_use_id = %tool_use_id, "no runtime, stall detection disabled");
            return;
        };
        let watch = StallWatch {
            session_id: self.session_id.clone(),
            tool_use_id: tool_use_id.clone(),
            subagent_type: subagent_type.to_owned(),
            metrics: Arc::clone(metrics),
            activity: Arc::clone(&self.activity),
            stall_timeout: self.config.stall_timeout,
            cancel: cancel.clone(),
        };
        let _ = handle.spawn(watch.run());
    }
}

impl Drop for SubtaskCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct StallWatch {
    session_id: SessionId,
    tool_use_id: ToolUseId,
    subagent_type: String,
    metrics: Arc<Mutex<ProgressMetrics>>,
    activity: Arc<dyn ActivitySink>,
    stall_timeout: Duration,
    cancel: CancellationToken,
}

impl StallWatch {
    async fn run(self) {
        let mut last_alert: Option<Instant> = None;
        loop {
            let last_progress = self.metrics.lock().last_progress_at;
            let since = last_alert.map_or(last_progress, |alert| alert.max(last_progress));
            let deadline = since + self.stall_timeout;

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {}
            }

            let now = Instant::now();
            let last_progress = self.metrics.lock().last_progress_at;
            let idle = now.duration_since(last_progress);
            if idle < self.stall_timeout {
                continue;
            }
            warn!(
                session_id = %self.session_id,
                tool_use_id = %self.tool_use_id,
                subagent_type = %self.subagent_type,
                idle_ms = idle.as_millis() as u64,
                "sub-task stalled"
            );
            counter!("subtask_stalled_total").increment(1);
            let activity = Activity::SubtaskStalled {
                session_id: self.session_id.clone(),
                tool_use_id: self.tool_use_id.clone(),
                subagent_type: self.subagent_type.clone(),
                idle_ms: idle.as_millis() as u64,
            };
            if let Err(e) = self.activity.notify(&activity) {
                warn!(tool_use_id = %self.tool_use_id, error = %e, "activity sink failed");
            }
            last_alert = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::mock::RecordingSinks;
    use serde_json::json;

    fn coordinator(
        breaker: Arc<SubagentCircuitBreaker>,
        sinks: &RecordingSinks,
    ) -> SubtaskCoordinator {
        SubtaskCoordinator::new(
            SessionId::from_raw("s1"),
            breaker,
            sinks.activity_sink(),
            SubtaskConfig {
                stall_timeout: Duration::from_secs(30),
                default_subagent_type: "general-purpose".into(),
            },
        )
    }

    fn breaker() -> Arc<SubagentCircuitBreaker> {
        Arc::new(SubagentCircuitBreaker::new(CircuitBreakerConfig {
            window: Duration::from_secs(600),
            failure_threshold: 3,
            cooldown: Duration::from_secs(600),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn subagent_type_defaults() {
        let sinks = RecordingSinks::default();
        let coord = coordinator(breaker(), &sinks);
        assert_eq!(coord.subagent_type_of(&json!({"subagent_type": "explore"})), "explore");
        assert_eq!(coord.subagent_type_of(&json!({"prompt": "x"})), "general-purpose");
        assert_eq!(coord.subagent_type_of(&json!({"subagent_type": ""})), "general-purpose");
    }

    #[tokio::test(start_paused = true)]
    async fn success_result_resets_breaker() {
        let sinks = RecordingSinks::default();
        let cb = breaker();
        cb.record_failure("explore");
        let coord = coordinator(Arc::clone(&cb), &sinks);

        let id = ToolUseId::from_raw("t1");
        assert!(coord.on_task_start(&id, &json!({"subagent_type": "explore"})).is_allowed());
        assert!(coord.is_tracking(&id));
        assert!(coord.on_result(&id, false));
        assert!(!coord.is_tracking(&id));
        assert!(cb.get_state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent() {
        let sinks = RecordingSinks::default();
        let cb = breaker();
        let coord = coordinator(Arc::clone(&cb), &sinks);
        let id = ToolUseId::from_raw("t1");
        let _ = coord.on_task_start(&id, &json!({"subagent_type": "explore"}));

        assert!(coord.on_result(&id, true));
        assert!(!coord.on_result(&id, true));
        assert_eq!(cb.recent_failures("explore"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_start_notifies_and_counts_failure() {
        let sinks = RecordingSinks::default();
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("explore");
        }
        let coord = coordinator(Arc::clone(&cb), &sinks);
        let id = ToolUseId::from_raw("t1");

        let admission = coord.on_task_start(&id, &json!({"subagent_type": "explore"}));
        assert_eq!(admission, TaskAdmission::Blocked { recent_failures: 3 });
        assert!(!coord.is_tracking(&id));
        assert_eq!(cb.recent_failures("explore"), 4);

        let activities = sinks.activities();
        assert_eq!(activities.len(), 1);
        assert!(activities[0].is_error());
        assert_eq!(activities[0].activity_type(), "subtask_blocked");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_refreshes_clock() {
        let sinks = RecordingSinks::default();
        let coord = coordinator(breaker(), &sinks);
        let id = ToolUseId::from_raw("t1");
        let _ = coord.on_task_start(&id, &json!({}));
        let started = coord.progress(&id).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        coord.on_progress(&id);
        let after = coord.progress(&id).unwrap();
        assert_eq!(after.progress_events, 1);
        assert_eq!(after.last_progress_at - started.last_progress_at, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_is_reported_without_progress() {
        let sinks = RecordingSinks::default();
        let coord = coordinator(breaker(), &sinks);
        let id = ToolUseId::from_raw("t1");
        let _ = coord.on_task_start(&id, &json!({}));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let activities = sinks.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].activity_type(), "subtask_stalled");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_postpones_stall() {
        let sinks = RecordingSinks::default();
        let coord = coordinator(breaker(), &sinks);
        let id = ToolUseId::from_raw("t1");
        let _ = coord.on_task_start(&id, &json!({}));

        tokio::time::sleep(Duration::from_secs(20)).await;
        coord.on_progress(&id);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(sinks.activities().is_empty());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sinks.activities().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_stall_watch() {
        let sinks = RecordingSinks::default();
        let cb = breaker();
        let coord = coordinator(Arc::clone(&cb), &sinks);
        let _ = coord.on_task_start(&ToolUseId::from_raw("t1"), &json!({}));
        let _ = coord.on_task_start(&ToolUseId::from_raw("t2"), &json!({}));

        coord.cancel_all();
        assert_eq!(coord.tracked_count(), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(sinks.activities().is_empty());
        assert!(cb.get_state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_survives_disconnected_sink() {
        let sinks = RecordingSinks::disconnected();
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("explore");
        }
        let coord = coordinator(Arc::clone(&cb), &sinks);
        let blocked = ToolUseId::from_raw("t1");
        let admission = coord.on_task_start(&blocked, &json!({"subagent_type": "explore"}));
        assert!(!admission.is_allowed());
        assert_eq!(cb.recent_failures("explore"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn result_cleanup_survives_disconnected_sink() {
        let sinks = RecordingSinks::disconnected();
        let cb = breaker();
        let coord = coordinator(Arc::clone(&cb), &sinks);
        let id = ToolUseId::from_raw("t1");
        assert!(coord.on_task_start(&id, &json!({"subagent_type": "plan"})).is_allowed());

        // The stall alert goes to a sink that rejects it.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sinks.activities().len(), 1);

        assert!(coord.on_result(&id, true));
        assert!(!coord.is_tracking(&id));
        assert!(coord.progress(&id).is_none());
        assert_eq!(cb.recent_failures("plan"), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sinks.activities().len(), 1);
    }
}
