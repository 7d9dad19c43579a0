//! Per-type circuit breaker for sub-task admission.
//!
//! Each sub-task type keeps an ordered list of failure timestamps. The list
//! is pruned to the sliding window on every read, so derived counts are never
//! stale. A type with no record has never failed (or was reset by a success).

use std::collections::HashMap;
use std::time::Duration;

use helm_settings::CircuitBreakerSettings;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub window: Duration,
    pub failure_threshold: usize,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            window: Duration::from_millis(settings.window_ms),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_millis(settings.cooldown_ms),
        }
    }
}

/// Snapshot of one type's breaker, computed at read time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub recent_failures: usize,
    pub is_open: bool,
}

/// Failure-history registry keyed by sub-task type.
///
/// One instance is shared (behind an `Arc`) by every turn in the process.
pub struct SubagentCircuitBreaker {
    config: CircuitBreakerConfig,
    records: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SubagentCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a new sub-task of `subagent_type` may start now.
    pub fn should_allow(&self, subagent_type: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock();
        let Some(failures) = records.get_mut(subagent_type) else {
            return true;
        };
        self.prune(failures, now);

        let Some(latest) = failures.last().copied() else {
            return true;
        };
        if now.duration_since(latest) > self.config.cooldown {
            debug!(subagent_type, "circuit half-open, allowing retry");
            return true;
        }
        let allowed = failures.len() < self.config.failure_threshold;
        if !allowed {
            warn!(
                subagent_type,
                recent_failures = failures.len(),
                threshold = self.config.failure_threshold,
                "circuit open, blocking sub-task"
            );
        }
        allowed
    }

    /// Append a failure. Recorded even while the circuit is open.
    pub fn record_failure(&self, subagent_type: &str) {
        let now = Instant::now();
        let mut records = self.records.lock();
        let failures = records.entry(subagent_type.to_owned()).or_default();
        failures.push(now);
        self.prune(failures, now);
        if failures.len() == self.config.failure_threshold {
            warn!(
                subagent_type,
                failures = failures.len(),
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    /// Forget every failure of `subagent_type`.
    pub fn record_success(&self, subagent_type: &str) {
        if self.records.lock().remove(subagent_type).is_some() {
            info!(subagent_type, "circuit breaker reset after success");
        }
    }

    /// Current state per type, from the pruned window.
    pub fn get_state(&self) -> HashMap<String, CircuitState> {
        let now = Instant::now();
        let mut records = self.records.lock();
        records
            .iter_mut()
            .map(|(kind, failures)| {
                self.prune(failures, now);
                let recent_failures = failures.len();
                (
                    kind.clone(),
                    CircuitState {
                        recent_failures,
                        is_open: recent_failures >= self.config.failure_threshold,
                    },
                )
            })
            .collect()
    }

    /// Pruned failure count for one type (0 when absent).
    pub fn recent_failures(&self, subagent_type: &str) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        records
            .get_mut(subagent_type)
            .map(|failures| {
                self.prune(failures, now);
                failures.len()
            })
            .unwrap_or(0)
    }

    // A failure exactly `window` old is outside the window.
    fn prune(&self, failures: &mut Vec<Instant>, now: Instant) {
        failures.retain(|ts| now.duration_since(*ts) < self.config.window);
    }
}

impl Default for SubagentCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> SubagentCircuitBreaker {
        SubagentCircuitBreaker::new(CircuitBreakerConfig {
            window: Duration::from_secs(600),
            failure_threshold: 3,
            cooldown: Duration::from_secs(600),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_type_is_allowed() {
        let cb = breaker();
        assert!(cb.should_allow("explore"));
        assert!(cb.get_state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold() {
        let cb = breaker();
        cb.record_failure("explore");
        cb.record_failure("explore");
        assert!(cb.should_allow("explore"));
        cb.record_failure("explore");
        assert!(!cb.should_allow("explore"));

        let state = cb.get_state();
        assert_eq!(
            state["explore"],
            CircuitState {
                recent_failures: 3,
                is_open: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn types_are_independent() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("explore");
        }
        assert!(!cb.should_allow("explore"));
        assert!(cb.should_allow("plan"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_deletes_record() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure("explore");
        }
        cb.record_success("explore");
        assert!(cb.should_allow("explore"));
        assert!(!cb.get_state().contains_key("explore"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_exactly_window_old_is_excluded() {
        let cb = breaker();
        cb.record_failure("explore");
        tokio::time::advance(Duration::from_secs(300)).await;
        cb.record_failure("explore");
        tokio::time::advance(Duration::from_secs(300)).await;

        // The first failure is now exactly 600s old.
        assert_eq!(cb.recent_failures("explore"), 1);
        assert_eq!(cb.get_state()["explore"].recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_just_inside_window_counts() {
        let cb = breaker();
        cb.record_failure("explore");
        tokio::time::advance(Duration::from_millis(599_999)).await;
        assert_eq!(cb.recent_failures("explore"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown() {
        let cb = SubagentCircuitBreaker::new(CircuitBreakerConfig {
            window: Duration::from_secs(600),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        });
        for _ in 0..3 {
            cb.record_failure("explore");
        }
        assert!(!cb.should_allow("explore"));

        tokio::time::advance(Duration::from_secs(61)).await;
        // Still three failures in the window, but the cooldown has passed.
        assert_eq!(cb.recent_failures("explore"), 3);
        assert!(cb.should_allow("explore"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_recorded_while_open() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("explore");
        }
        assert_eq!(cb.recent_failures("explore"), 5);
    }

    #[test]
    fn config_from_settings() {
        let config = CircuitBreakerConfig::from(&CircuitBreakerSettings {
            window_ms: 1_000,
            failure_threshold: 2,
            cooldown_ms: 500,
        });
        assert_eq!(config.window, Duration::from_secs(1));
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.cooldown, Duration::from_millis(500));
    }
}
