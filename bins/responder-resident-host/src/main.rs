use anyhow::{Context, Result};
use clap::Parser;
use responder_resident::builtin::builtin_registry;
use responder_resident::ResidentHost;
use std::path::PathBuf;
use tracing::info;

/// Resident action host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base path of the pipe pair (`<PATH>-m2s` / `<PATH>-s2m`)
    #[arg(long, value_name = "PATH")]
    pipe: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug);

    info!("Starting resident host on {}", args.pipe.display());
    ResidentHost::new(builtin_registry())
        .run(&args.pipe)
        .await
        .with_context(|| format!("Resident host on {} failed", args.pipe.display()))?;
    info!("Resident host finished");
    Ok(())
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    // stdout is not ours to use; the dispatcher may capture it.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
