use std::path::PathBuf;

use clap::Parser;
use td_worker::WorkerArgs;

/// Runs a single function invocation: parses the request, invokes the
/// bundle's entrypoint, and writes exactly one of `response.yaml` or
/// `exception.yaml`.
#[derive(Parser, Debug)]
#[command(name = "tdworker")]
struct Args {
    #[arg(long)]
    request_folder: PathBuf,
    #[arg(long)]
    response_folder: PathBuf,
    #[arg(long)]
    output_folder: PathBuf,
    #[arg(long)]
    bin_folder: PathBuf,
    #[arg(long)]
    logs_folder: Option<PathBuf>,
    #[arg(long)]
    current_instance: Option<String>,
    #[arg(long)]
    work: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let worker_args = WorkerArgs {
        request_folder: args.request_folder,
        response_folder: args.response_folder,
        output_folder: args.output_folder,
        bin_folder: args.bin_folder,
        work: args.work,
    };

    let code = run_cancelable(worker_args).await;
    std::process::exit(code);
}

/// Races the worker's run to completion against a forwarded SIGTERM. A
/// SIGTERM is treated as a cooperative stop request: the entrypoint
/// subprocess is killed as a side effect of dropping the losing `run`
/// future (it's spawned with `kill_on_drop(true)`), and `exception.yaml`
/// gets `kind=Canceled` instead of whatever the in-flight run would have
/// written.
#[cfg(unix)]
async fn run_cancelable(worker_args: WorkerArgs) -> i32 {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler, running without cancellation");
            return td_worker::run(&worker_args).await;
        },
    };

    tokio::select! {
        code = td_worker::run(&worker_args) => code,
        _ = sigterm.recv() => {
            tracing::warn!("received SIGTERM, canceling the in-flight run");
            if let Err(e) = td_worker::write_canceled_exception(&worker_args.response_folder) {
                tracing::error!(error = %e, "failed to write exception.yaml after cancellation");
            }
            td_errors::EXIT_GENERAL_ERROR
        },
    }
}

#[cfg(not(unix))]
async fn run_cancelable(worker_args: WorkerArgs) -> i32 {
    td_worker::run(&worker_args).await
}
