//! tunnelrun-worker - runs one partition of the test suite
//!
//! Started by the control process as `tunnelrun-worker <index> <config>`.
//! Stdout carries the completion report, so logs go to stderr.

use clap::Parser;
use std::process::ExitCode;
use tracing::error;

use tunnelrun_cli::{init_tracing, LogTarget};
use tunnelrun_common::CompletionReport;
use tunnelrun_runner::WorkerInvocation;

#[derive(Parser)]
#[command(name = "tunnelrun-worker")]
#[command(version, about = "Runs one tunnelrun test partition", long_about = None)]
struct Args {
    /// Worker index (selects the partition)
    index: usize,

    /// Base64-encoded JSON run configuration
    config: String,

    /// Enable verbose output
    #[arg(short, long, env = "TUNNELRUN_WORKER_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing(args.verbose, false, LogTarget::Stderr) {
        eprintln!("tunnelrun-worker: logging unavailable: {}", e);
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            // No report: the control process counts this worker as incomplete
            error!("Worker could not run: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let invocation = WorkerInvocation::from_args(args.index, &args.config)?;
    let failures = invocation.run().await?;

    CompletionReport::new(failures).send(std::io::stdout().lock())?;
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
