//! tunnelrun CLI
//!
//! Shared pieces of the `tunnelrun` and `tunnelrun-worker` binaries.

pub mod output;

use tracing_subscriber::EnvFilter;

/// Where log records go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Workers keep stdout for the completion report
    Stderr,
}

/// Initialize logging. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool, json: bool, target: LogTarget) -> anyhow::Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match (json, target) {
        (false, LogTarget::Stdout) => builder.try_init(),
        (false, LogTarget::Stderr) => builder.with_writer(std::io::stderr).try_init(),
        (true, LogTarget::Stdout) => builder.json().try_init(),
        (true, LogTarget::Stderr) => builder.json().with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!(e))
}
