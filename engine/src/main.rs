use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holdfast_core::{Enforcer, EnforcerConfig, LoopbackHome};
use holdfast_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
};
use holdfast_types::{LiveState, ServiceCall};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "holdfast-engine")]
#[command(about = "Keeps configured lights in the state they were last asked to be in")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enforce against an in-process home fed with JSON service calls on stdin.
    Run {
        #[arg(long, env = "HOLDFAST_CONFIG")]
        config: Option<String>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        tolerance: Option<f64>,
        #[arg(long)]
        max_backoff: Option<u32>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Print the effective configuration.
    CheckConfig {
        #[arg(long, env = "HOLDFAST_CONFIG")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            interval_ms,
            tolerance,
            max_backoff,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(&logs_dir, 14)?;
            info!("engine logging initialized: {:?}", log_info);

            let overrides = build_cli_overrides(interval_ms, tolerance, max_backoff);
            let config_path = config.map(PathBuf::from);
            let config = EnforcerConfig::load(config_path.as_deref(), overrides)
                .await
                .context("invalid holdfast configuration")?;
            log_startup(&state_dir, config_path.as_deref(), &config);

            run(config).await?;
        }
        Command::CheckConfig { config } => {
            let config_path = config.map(PathBuf::from);
            let config = EnforcerConfig::load(config_path.as_deref(), None)
                .await
                .context("invalid holdfast configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run(config: EnforcerConfig) -> anyhow::Result<()> {
    let home = Arc::new(LoopbackHome::default());
    for light in &config.lights {
        home.set_live(light, LiveState::off()).await;
    }
    let bus = home.bus().clone();
    let enforcer = Arc::new(Enforcer::new(&config, home.clone(), home.clone()));
    let cancel = CancellationToken::new();
    let mut tasks = enforcer.start(&bus, cancel.clone());

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            read = stdin.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => {
                info!("stdin closed, shutting down");
                break;
            }
            Ok(_) => match parse_external_line(&line) {
                Ok(Some(call)) => {
                    home.apply_external(&call).await;
                    bus.publish(call);
                }
                Ok(None) => {}
                Err(err) => warn!("ignoring stdin line: {err:#}"),
            },
            Err(err) => {
                warn!("stdin read failed, shutting down: {err}");
                break;
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!("enforcer task ended abnormally: {err}");
        }
    }
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            event: "enforcer.stopped",
            component: "engine.main",
            status: Some("ok"),
            ..ObservabilityEvent::default()
        },
    );
    Ok(())
}

/// One raw stdin line. Blank lines yield `None`; bytes that are not UTF-8 or
/// not a service call are an error for that line only.
fn parse_external_line(raw: &[u8]) -> anyhow::Result<Option<ServiceCall>> {
    let line = std::str::from_utf8(raw).context("stdin line is not valid UTF-8")?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    parse_external_call(line).map(Some)
}

/// A service call from stdin. Calls without a context id get a fresh one so
/// they are always treated as coming from another actor.
fn parse_external_call(line: &str) -> anyhow::Result<ServiceCall> {
    let mut call: ServiceCall =
        serde_json::from_str(line).context("expected a JSON service call")?;
    if call.context_id.trim().is_empty() {
        call.context_id = Uuid::new_v4().to_string();
    }
    Ok(call)
}

fn build_cli_overrides(
    interval_ms: Option<u64>,
    tolerance: Option<f64>,
    max_backoff: Option<u32>,
) -> Option<serde_json::Value> {
    if interval_ms.is_none() && tolerance.is_none() && max_backoff.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(v) = interval_ms {
        root.insert("interval_ms".to_string(), serde_json::Value::from(v));
    }
    if let Some(v) = tolerance {
        root.insert("tolerance".to_string(), serde_json::Value::from(v));
    }
    if let Some(v) = max_backoff {
        root.insert("max_backoff".to_string(), serde_json::Value::from(v));
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("HOLDFAST_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".holdfast")
}

fn log_startup(state_dir: &Path, config_path: Option<&Path>, config: &EnforcerConfig) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "starting holdfast-engine: exe={} state_dir={} config_path={}",
        exe.display(),
        state_dir.display(),
        config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    info!(
        "lights={:?} interval_ms={} tolerance={} max_backoff={}",
        config.lights, config.interval_ms, config.tolerance, config.max_backoff
    );
}
