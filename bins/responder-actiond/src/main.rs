use anyhow::{Context, Result};
use clap::Parser;
use responder_actions::{ActionManager, ActionManagerConfig, Collaborators};
use responder_common::{
    EventRecord, MemoryLogStore, MemorySessionStore, RecordingIncidentSender, StaticActionQuery,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Action dispatcher daemon
///
/// Reads one JSON event per line from stdin and runs every configured action
/// the event matches.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run duration in seconds (for testing)
    #[arg(long)]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug);

    info!("Starting action dispatcher");
    info!("Config file: {}", args.config);

    let mut config = ActionManagerConfig::load_from_file(&args.config)?;
    let actions = std::mem::take(&mut config.actions);
    info!("Loaded configuration with {} actions", actions.len());

    let logs = Arc::new(MemoryLogStore::new());
    let collaborators = Collaborators {
        logs: logs.clone(),
        sessions: Arc::new(MemorySessionStore::new()),
        query: Arc::new(StaticActionQuery::new(actions)),
        incidents: Arc::new(RecordingIncidentSender::new()),
    };
    let manager = ActionManager::new(config, collaborators)
        .await
        .context("Failed to create action manager")?;

    let events = tokio::spawn(read_events(manager.clone()));

    match args.run_duration {
        Some(duration) => {
            info!("Running for {} seconds (test mode)", duration);
            tokio::time::sleep(tokio::time::Duration::from_secs(duration)).await;
        }
        None => shutdown_signal().await?,
    }

    info!("Shutting down action dispatcher...");
    events.abort();
    manager
        .reset()
        .await
        .map_err(|e| anyhow::anyhow!("Shutdown failed: {}", e))?;

    for log in logs.all() {
        debug!(
            "Action log {}: action {} {} (exit code {}, failure {:?})",
            log.id, log.action_id, log.status, log.exit_code, log.failure_code
        );
    }
    info!("Action dispatcher shut down successfully");
    Ok(())
}

/// Feed stdin events to the dispatcher until EOF.
async fn read_events(manager: ActionManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Event input closed");
                return;
            }
            Err(e) => {
                error!("Failed to read event input: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: EventRecord = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed event: {}", e);
                continue;
            }
        };

        match manager.handle_event(event).await {
            Ok(reports) => {
                for report in reports {
                    match report.result {
                        Ok(dispatched) => info!(
                            "Action {} dispatched (log {}, {})",
                            report.action_id, dispatched.log_id, dispatched.status
                        ),
                        Err(e) => warn!("Action {} not dispatched: {}", report.action_id, e),
                    }
                }
            }
            Err(e) => {
                error!("Event handling failed: {}", e);
                return;
            }
        }
    }
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
        _ = sigint.recv() => info!("Received SIGINT signal"),
    }
    Ok(())
}
