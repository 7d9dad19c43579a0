//! Settings type definitions.
//!
//! Field names serialize as camelCase. Every section implements [`Default`]
//! with the production values and is marked `#[serde(default)]`, so partial
//! JSON files only need the keys they change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmSettings {
    pub pipeline: PipelineSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub subtasks: SubtaskSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

impl HelmSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.default_stage_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline.defaultStageTimeoutMs must be > 0".into(),
            ));
        }
        if let Some((stage, _)) = self.pipeline.stage_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(SettingsError::InvalidValue(format!(
                "pipeline.stageTimeoutsMs.{stage} must be > 0"
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "circuitBreaker.failureThreshold must be > 0".into(),
            ));
        }
        if self.session.audit_log_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "session.auditLogCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Message pipeline timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Deadline applied to a stage with no explicit timeout.
    pub default_stage_timeout_ms: u64,
    /// Per-stage overrides keyed by stage name.
    pub stage_timeouts_ms: HashMap<String, u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_stage_timeout_ms: 120_000,
            stage_timeouts_ms: HashMap::new(),
        }
    }
}

/// Sub-task circuit breaker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    pub window_ms: u64,
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            window_ms: 600_000,
            failure_threshold: 3,
            cooldown_ms: 600_000,
        }
    }
}

/// Sub-task lifecycle tracking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubtaskSettings {
    /// Silence after which a running sub-task is reported as stalled.
    pub stall_timeout_ms: u64,
    /// Default `subagent_type` when a Task invocation names none.
    pub default_subagent_type: String,
}

impl Default for SubtaskSettings {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 300_000,
            default_subagent_type: "general-purpose".to_string(),
        }
    }
}

/// Per-session bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub audit_log_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            audit_log_capacity: 100,
        }
    }
}

/// Log output configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"helm_engine": "debug"}`.
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: HashMap::new(),
        }
    }
}
