//! tunnelrun Common Library
//!
//! Shared configuration, the parent/worker wire protocol, and error types used
//! by the control process and by worker subprocesses.

pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use config::{
    Credential, LogSettings, ProviderSettings, RunConfig, SeleniumEndpoint, ServerSettings,
    ServiceKind, TunnelSettings, WorkerSettings,
};
pub use error::{Error, Result};
pub use protocol::{CompletionReport, REPORT_PREFIX};

/// tunnelrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file used when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "config/tunnelrun.toml";
