//! tunnelrun CLI - Main Entry Point
//!
//! Loads a run configuration, drives one run and maps its outcome to the
//! process exit code.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunnelrun_cli::output::{self, OutputFormat};
use tunnelrun_cli::{init_tracing, LogTarget};
use tunnelrun_common::{RunConfig, ServiceKind, DEFAULT_CONFIG_PATH};
use tunnelrun_runner::Orchestrator;

/// tunnelrun - run a browser test suite in parallel through a provider tunnel
#[derive(Parser)]
#[command(name = "tunnelrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run configuration file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Provider to use instead of the one in the config file
    #[arg(long, env = "TUNNELRUN_SERVICE")]
    service: Option<ServiceKind>,

    /// Results format
    #[arg(long, default_value = "plain")]
    format: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Keep stdout clean for the JSON summary
    let target = match cli.format {
        OutputFormat::Plain => LogTarget::Stdout,
        OutputFormat::Json => LogTarget::Stderr,
    };
    init_tracing(cli.verbose, cli.log_json, target)?;

    let mut config = RunConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(service) = cli.service {
        config.service = service;
        config.validate()?;
    }
    info!("tunnelrun v{} using {}", tunnelrun_common::VERSION, config.service);

    let log_dir = config.log.directory.clone();
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; tearing down");
                shutdown.cancel();
            }
        }
    });

    let mut orchestrator = Orchestrator::from_config(config)?.with_shutdown(shutdown);
    let result = orchestrator.run().await;

    output::print_results(&result, &log_dir, cli.format);
    std::process::exit(result.exit_code());
}
