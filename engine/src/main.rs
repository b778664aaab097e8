use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kymon_channels::EventBus;
use kymon_core::{
    ComfyQueueSource, Monitor, MonitorConfig, QueueSource, SnapshotBuilder, StaticQueueSource,
};
use kymon_observability::{
    canonical_logs_dir_from_root, emit_event, init_console_logging, init_process_logging,
    ObservabilityEvent, ProcessKind,
};
use kymon_types::DeliveryEnvelope;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Parser, Debug)]
#[command(name = "kymon-engine")]
#[command(about = "ComfyUI queue monitor that broadcasts status snapshots to notification sinks")]
struct Cli {
    /// JSON config file; defaults to ./config.json when present.
    #[arg(long, global = true, env = "KY_MONITOR_CONFIG")]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor a ComfyUI instance until interrupted.
    Run {
        #[arg(long, env = "KY_MONITOR_COMFYUI_URL", default_value = DEFAULT_COMFYUI_URL)]
        comfyui_url: String,
        #[arg(long, env = "KY_MONITOR_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long, default_value_t = 14)]
        log_retention_days: u64,
        /// Do not follow the ComfyUI websocket for the executing node.
        #[arg(long, default_value_t = false)]
        no_progress: bool,
        /// Print every published envelope to stdout as a JSON line.
        #[arg(long, default_value_t = false)]
        print: bool,
    },
    /// Build one snapshot and print it.
    Snapshot {
        /// Read the queue state from a JSON file instead of ComfyUI.
        #[arg(long)]
        state: Option<String>,
        #[arg(long, env = "KY_MONITOR_COMFYUI_URL", default_value = DEFAULT_COMFYUI_URL)]
        comfyui_url: String,
        /// Override the history window.
        #[arg(long)]
        window: Option<usize>,
    },
    /// Print the effective configuration with secrets redacted.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Command::Run {
            comfyui_url,
            state_dir,
            log_retention_days,
            no_progress,
            print,
        } => {
            let logs_dir = canonical_logs_dir_from_root(&resolve_state_dir(state_dir));
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Monitor, &logs_dir, log_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Monitor,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("monitor jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("monitor logging initialized: {:?}", log_info);

            let config = MonitorConfig::load(config_path.as_deref()).await;
            run_monitor(config, &comfyui_url, !no_progress, print).await?;
        }
        Command::Snapshot {
            state,
            comfyui_url,
            window,
        } => {
            init_console_logging();
            let config = MonitorConfig::load(config_path.as_deref()).await;
            let window = window.unwrap_or(config.history_window);
            let source: Arc<dyn QueueSource> = match state {
                Some(path) => Arc::new(StaticQueueSource::from_file(Path::new(&path)).await?),
                None => Arc::new(ComfyQueueSource::new(&comfyui_url)?),
            };
            let queue = source
                .read_state(window)
                .await
                .with_context(|| format!("read queue state from {}", source.name()))?;
            let snapshot = SnapshotBuilder::new(window).build(&queue);
            let envelope = DeliveryEnvelope::new(config.sinks.event_bus.event_name, snapshot);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        Command::Config => {
            init_console_logging();
            let config = MonitorConfig::load(config_path.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&config.to_redacted_value())?);
        }
    }

    Ok(())
}

async fn run_monitor(
    config: MonitorConfig,
    comfyui_url: &str,
    follow_progress: bool,
    print: bool,
) -> anyhow::Result<()> {
    let source = Arc::new(ComfyQueueSource::new(comfyui_url)?);
    let listener_cancel = CancellationToken::new();
    let listener = follow_progress.then(|| source.spawn_progress_listener(listener_cancel.clone()));

    let bus = EventBus::new();
    let printer = print.then(|| spawn_printer(&bus));

    let monitor = Monitor::with_sinks(config, source.clone(), Some(bus)).await;
    monitor.start();
    info!("monitoring ComfyUI at {}", source.base_url());

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("interrupt received, shutting down");

    monitor.stop().await;
    listener_cancel.cancel();
    if let Some(listener) = listener {
        let _ = listener.await;
    }
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

fn spawn_printer(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => match serde_json::to_string(envelope.as_ref()) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!("failed to encode envelope: {err}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("printer fell behind, skipped {skipped} envelopes")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn resolve_config_path(flag: Option<String>) -> Option<PathBuf> {
    if let Some(path) = flag.filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    fallback.exists().then_some(fallback)
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    flag.filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".kymon"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["kymon-engine", "run"]).unwrap();
        match cli.command {
            Command::Run {
                comfyui_url,
                no_progress,
                print,
                ..
            } => {
                if std::env::var("KY_MONITOR_COMFYUI_URL").is_err() {
                    assert_eq!(comfyui_url, DEFAULT_COMFYUI_URL);
                }
                assert!(!no_progress);
                assert!(!print);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_snapshot_from_state_file() {
        let cli = Cli::try_parse_from([
            "kymon-engine",
            "--config",
            "custom.json",
            "snapshot",
            "--state",
            "queue.json",
            "--window",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("custom.json"));
        match cli.command {
            Command::Snapshot { state, window, .. } => {
                assert_eq!(state.as_deref(), Some("queue.json"));
                assert_eq!(window, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            resolve_config_path(Some("x.json".to_string())),
            Some(PathBuf::from("x.json"))
        );
    }

    #[test]
    fn state_dir_defaults_to_dot_kymon() {
        assert_eq!(resolve_state_dir(None), PathBuf::from(".kymon"));
        assert_eq!(resolve_state_dir(Some(" ".to_string())), PathBuf::from(".kymon"));
        assert_eq!(
            resolve_state_dir(Some("/var/lib/kymon".to_string())),
            PathBuf::from("/var/lib/kymon")
        );
    }
}
