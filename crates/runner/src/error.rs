//! Control-plane error types
//!
//! A `ControlError` means the orchestration machinery failed. Failing tests and
//! crashed workers are never reported through this type; they show up as counts
//! in the pool result.

use std::time::Duration;
use thiserror::Error;
use tunnelrun_common::ServiceKind;

use crate::process::ExitOutcome;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Config(#[from] tunnelrun_common::Error),

    #[error("Missing config.{service}.{field}")]
    MissingCredential {
        service: ServiceKind,
        field: &'static str,
    },

    #[error("Failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Local server failed to bind {addr}: {source}")]
    ServerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Local server error: {0}")]
    Server(String),

    #[error("Timed out after {timeout:?} waiting for {service} tunnel to initialize")]
    ReadinessTimeout {
        service: ServiceKind,
        timeout: Duration,
    },

    #[error("{service} tunnel exited before it was ready ({outcome})")]
    TunnelExitedBeforeReady {
        service: ServiceKind,
        outcome: ExitOutcome,
    },

    #[error("{service} tunnel exited unexpectedly ({outcome})")]
    TunnelLost {
        service: ServiceKind,
        outcome: ExitOutcome,
    },

    #[error("A {service} tunnel is already running")]
    TunnelAlreadyRunning { service: ServiceKind },

    #[error("Run interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    pub(crate) fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        ControlError::Spawn {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        ControlError::ServerBind {
            addr: addr.into(),
            source,
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
