use std::{path::PathBuf, time::Duration};

use clap::Parser;
use td_runtime::ProdRuntime;
use tokio::sync::watch;

/// Periodically garbage-collects aged execution artifacts.
#[derive(Parser, Debug)]
#[command(name = "tdjanitor")]
struct Args {
    /// Root of the instance's persisted state directory.
    #[arg(long, env = "TD_INSTANCE_ROOT")]
    instance_root: PathBuf,

    /// Seconds between ticks.
    #[arg(long, default_value_t = 60)]
    frequency_secs: u64,

    /// Seconds a completed message survives before its cast folders are
    /// pruned.
    #[arg(long, default_value_t = 86_400)]
    retention_secs: u64,

    /// Maximum number of messages pruned in a single tick.
    #[arg(long, default_value_t = 1000)]
    per_run_limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = td_janitor::JanitorConfig {
        instance_root: args.instance_root,
        frequency: Duration::from_secs(args.frequency_secs),
        retention: Duration::from_secs(args.retention_secs),
        per_run_limit: args.per_run_limit,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = td_janitor::run(config, ProdRuntime, stop_rx) => {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, stopping janitor");
            let _ = stop_tx.send(true);
        },
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, stopping janitor");
            let _ = stop_tx.send(true);
        },
    }

    Ok(())
}
