//! # helm
//!
//! Command-line driver for the helm engine. `helm replay` feeds a scripted
//! provider stream through the full message pipeline and prints every
//! emission as a JSON line on stdout.

#![deny(unsafe_code)]

mod replay;

use std::io::Stdout;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use helm_core::SessionId;
use helm_engine::mock::{ScriptedGateway, ScriptedTurn};
use helm_engine::{
    CircuitBreakerConfig, Collaborators, MessagePipeline, SessionContextStore, SplitterSinks,
    SubagentCircuitBreaker, SubtaskConfig,
};
use helm_settings::HelmSettings;
use helm_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info, Level};

use crate::replay::{JsonLines, OutputLine, ReplayScript};

#[derive(Parser, Debug)]
#[command(name = "helm", about = "Session-processing engine driver")]
struct Cli {
    /// Settings file (defaults to ~/.helm/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Per-module log level, e.g. `helm_engine=debug`. Repeatable.
    #[arg(long = "log-module", value_name = "MODULE=LEVEL", global = true)]
    log_modules: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scripted provider turns through the pipeline.
    Replay {
        /// JSON file: an event array, or `{"turns": [{"message", "events"}]}`.
        #[arg(long)]
        script: PathBuf,

        /// Session id to run the turns in (a fresh one by default).
        #[arg(long)]
        session: Option<String>,

        /// Session state file: loaded before the turns when present, and
        /// written back afterwards (also after a failed turn).
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print the effective settings.
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => helm_settings::load_settings_from_path(path),
        None => helm_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if cli.json_logs {
        settings.logging.json = true;
    }

    let telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging))
        .context("failed to initialize telemetry")?;
    for spec in &cli.log_modules {
        let (module, level) = parse_module_level(spec)?;
        telemetry
            .set_module_level(module, level)
            .with_context(|| format!("failed to apply log level {spec}"))?;
    }

    match cli.command {
        Command::Replay {
            script,
            session,
            state,
        } => replay(&settings, script, session, state).await,
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn parse_module_level(spec: &str) -> Result<(&str, Level)> {
    let (module, level) = spec
        .split_once('=')
        .with_context(|| format!("expected MODULE=LEVEL, got {spec:?}"))?;
    let level: Level = level
        .parse()
        .with_context(|| format!("unknown log level in {spec:?}"))?;
    Ok((module, level))
}

fn load_state(store: &SessionContextStore, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let loaded = store
        .import_json(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))?;
    info!(path = %path.display(), sessions = loaded, "session state loaded");
    Ok(())
}

fn save_state(store: &SessionContextStore, path: &Path) -> Result<()> {
    let encoded = store.export_json().context("failed to encode session state")?;
    std::fs::write(path, encoded)
        .with_context(|| format!("failed to write state file {}", path.display()))?;
    info!(path = %path.display(), sessions = store.len(), "session state saved");
    Ok(())
}

async fn replay(
    settings: &HelmSettings,
    script: PathBuf,
    session: Option<String>,
    state: Option<PathBuf>,
) -> Result<()> {
    let turns = ReplayScript::load(&script)?.into_turns();
    let session_id = session.map(SessionId::from_raw).unwrap_or_default();
    info!(session_id = %session_id, turns = turns.len(), script = %script.display(), "replay starting");

    let messages: Vec<String> = turns
        .iter()
        .enumerate()
        .map(|(i, turn)| turn.message.clone().unwrap_or_else(|| format!("replay turn {}", i + 1)))
        .collect();
    let gateway = ScriptedGateway::new(
        turns
            .into_iter()
            .map(|turn| ScriptedTurn::Events(turn.events))
            .collect(),
    );

    let out: Arc<JsonLines<Stdout>> = Arc::new(JsonLines::new(std::io::stdout()));
    let sinks = SplitterSinks {
        messages: out.clone(),
        tools: out.clone(),
        activity: out.clone(),
    };
    let breaker = Arc::new(SubagentCircuitBreaker::new(CircuitBreakerConfig::from(
        &settings.circuit_breaker,
    )));
    let collaborators = Arc::new(
        Collaborators::new(Arc::new(gateway), breaker)
            .with_sinks(sinks)
            .with_subtasks(SubtaskConfig::from(&settings.subtasks)),
    );
    let pipeline = MessagePipeline::from_settings(settings);
    if let Some(path) = &state {
        load_state(pipeline.store(), path)?;
    }

    let outcome = run_turns(&pipeline, &session_id, messages, &collaborators, &out).await;
    if let Some(path) = &state {
        save_state(pipeline.store(), path)?;
    }
    outcome?;

    info!(session_id = %session_id, "replay finished");
    Ok(())
}

async fn run_turns(
    pipeline: &MessagePipeline,
    session_id: &SessionId,
    messages: Vec<String>,
    collaborators: &Arc<Collaborators>,
    out: &JsonLines<Stdout>,
) -> Result<()> {
    for (index, message) in messages.into_iter().enumerate() {
        match pipeline
            .submit(session_id, message, Arc::clone(collaborators))
            .await
        {
            Ok(context) => {
                out.emit(&OutputLine::Context(&context))
                    .context("failed to write to stdout")?;
            }
            Err(err) => {
                error!(session_id = %session_id, turn = index + 1, error = %err, "replay turn failed");
                if let Some(context) = pipeline.store().get(session_id) {
                    let _ = out.emit(&OutputLine::Context(&context));
                }
                return Err(err).with_context(|| format!("turn {} failed", index + 1));
            }
        }
    }
    Ok(())
}
