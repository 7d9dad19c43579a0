//! # helm-telemetry
//!
//! Process-wide `tracing` setup: an [`EnvFilter`] built from config (or
//! `RUST_LOG`) feeding either a JSON or a human-readable fmt layer. Logs go
//! to stderr so stdout stays free for program output. The filter sits behind
//! a reload handle, so per-module levels can change while running.

use helm_settings::LoggingSettings;
use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "helm_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of pretty output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` settings section. Unknown level names fall
    /// back to INFO for the default and are skipped for module overrides.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        let mut module_levels: Vec<(String, Level)> = settings
            .module_levels
            .iter()
            .filter_map(|(module, level)| Some((module.clone(), level.parse().ok()?)))
            .collect();
        module_levels.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            log_level: settings.level.parse().unwrap_or(Level::INFO),
            module_levels,
            json: settings.json,
        }
    }

    /// Filter directive string, e.g. `info,helm_engine=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("global tracing subscriber already installed: {0}")]
    AlreadyInitialized(String),
    #[error("failed to reload log filter: {0}")]
    Reload(String),
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle returned by [`init_telemetry`]. Holds the live filter so module
/// levels can change at runtime.
pub struct TelemetryGuard {
    base_level: Level,
    module_levels: RwLock<Vec<(String, Level)>>,
    filter: FilterHandle,
    json: bool,
}

impl TelemetryGuard {
    /// Override one module's level and swap the live filter. The new filter
    /// is built from config, so it replaces any `RUST_LOG` directives.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let mut levels = self.module_levels.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
        let directives = TelemetryConfig {
            log_level: self.base_level,
            module_levels: levels.clone(),
            json: self.json,
        }
        .filter_directives();
        self.filter
            .reload(EnvFilter::new(&directives))
            .map_err(|e| TelemetryError::Reload(e.to_string()))?;
        tracing::debug!(filter = %directives, "log filter reloaded");
        Ok(())
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Directives the live filter was last built from (`RUST_LOG` aside).
    pub fn filter_directives(&self) -> Option<String> {
        self.filter.with_current(|f| f.to_string()).ok()
    }

    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter_str = config.filter_directives();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true);
        registry.with(fmt_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true);
        registry.with(fmt_layer).try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(filter = %filter_str, json = config.json, "telemetry initialized");

    Ok(TelemetryGuard {
        base_level: config.log_level,
        module_levels: RwLock::new(config.module_levels),
        filter,
        json: config.json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("helm_engine".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.filter_directives(), "warn,helm_engine=debug");
    }

    #[test]
    fn from_settings_parses_levels() {
        let mut settings = LoggingSettings::default();
        settings.level = "debug".into();
        settings.json = true;
        let _ = settings.module_levels.insert("helm_engine".into(), "trace".into());
        let _ = settings.module_levels.insert("noisy".into(), "not-a-level".into());

        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
        assert_eq!(config.module_levels, vec![("helm_engine".to_string(), Level::TRACE)]);
    }

    #[test]
    fn unknown_default_level_falls_back_to_info() {
        let mut settings = LoggingSettings::default();
        settings.level = "loud".into();
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }

    // The global subscriber can only be installed once per process, so the
    // init and reload checks share one test.
    #[test]
    fn init_once_then_reload_module_levels() {
        std::env::remove_var("RUST_LOG");
        let guard = init_telemetry(TelemetryConfig {
            log_level: Level::WARN,
            module_levels: Vec::new(),
            json: false,
        })
        .unwrap();
        let initial = guard.filter_directives().unwrap();
        assert!(initial.contains("warn") && !initial.contains("helm_engine"), "{initial}");

        guard.set_module_level("helm_engine", Level::DEBUG).unwrap();
        guard.set_module_level("helm_engine", Level::TRACE).unwrap();
        assert_eq!(guard.module_levels(), vec![("helm_engine".to_string(), Level::TRACE)]);
        let live = guard.filter_directives().unwrap();
        assert!(live.contains("helm_engine=trace"), "{live}");
        assert!(!live.contains("helm_engine=debug"), "{live}");

        let second = init_telemetry(TelemetryConfig::default());
        assert!(matches!(second, Err(TelemetryError::AlreadyInitialized(_))));
    }
}
