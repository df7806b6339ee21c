//! Child process supervision
//!
//! Every subprocess the control process starts (tunnel, workers) is owned by a
//! small supervisor task. The task is the only place that waits on the OS
//! process; it publishes the exit exactly once on a `watch` channel, and
//! accepts a single termination request. Dropping a [`SupervisedChild`]
//! counts as a termination request, so a handle can never leak a process.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit could not be observed (wait failed or supervisor vanished)
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Receiver side of a process exit notification.
///
/// Cloneable; every clone observes the same single outcome.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWatch {
    pub(crate) fn new(rx: watch::Receiver<Option<ExitOutcome>>) -> Self {
        Self { rx }
    }

    /// Resolve once the process has exited. Returns immediately if it already has.
    pub async fn wait(&mut self) -> ExitOutcome {
        loop {
            if let Some(outcome) = *self.rx.borrow_and_update() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Supervisor gone without publishing
                let last = *self.rx.borrow();
                return last.unwrap_or_else(ExitOutcome::unknown);
            }
        }
    }

    /// Exit outcome if the process has already exited
    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.rx.borrow()
    }
}

/// Handle to a running subprocess owned by a supervisor task
#[derive(Debug)]
pub struct SupervisedChild {
    label: String,
    pid: Option<u32>,
    exit: ExitWatch,
    terminate: Option<oneshot::Sender<()>>,
}

impl SupervisedChild {
    /// Spawn `command` under supervision.
    ///
    /// If stdout was configured as piped it is handed back to the caller; the
    /// supervisor never reads output.
    pub fn spawn(
        command: &mut Command,
        label: impl Into<String>,
    ) -> io::Result<(Self, Option<ChildStdout>)> {
        command.kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let pid = child.id();
        let label = label.into();

        debug!("Spawned {} (pid: {:?})", label, pid);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (term_tx, term_rx) = oneshot::channel();
        tokio::spawn(supervise(child, label.clone(), term_rx, exit_tx));

        Ok((
            Self {
                label,
                pid,
                exit: ExitWatch::new(exit_rx),
                terminate: Some(term_tx),
            },
            stdout,
        ))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Independent receiver for this process's exit
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.outcome().is_some()
    }

    /// Ask the supervisor to terminate the process. Later calls are no-ops.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            // Err means the supervisor already finished: nothing left to signal
            let _ = tx.send(());
        }
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> ExitOutcome {
        self.exit.wait().await
    }
}

async fn supervise(
    mut child: Child,
    label: String,
    mut term_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    enum Wake {
        Exited(io::Result<ExitStatus>),
        Terminate,
    }

    // A dropped handle resolves term_rx with an error, which also terminates
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = &mut term_rx => Wake::Terminate,
    };

    let status = match wake {
        Wake::Exited(status) => status,
        Wake::Terminate => {
            send_terminate(&mut child, &label);
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => {
            warn!("Failed waiting on {}: {}", label, e);
            ExitOutcome::unknown()
        }
    };

    debug!("{} exited ({})", label, outcome);
    exit_tx.send_replace(Some(outcome));
}

/// SIGTERM where available so the child can clean up; hard kill otherwise
fn send_terminate(child: &mut Child, label: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to {} (pid: {})", label, pid);
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => return,
                Err(e) => warn!("SIGTERM to {} failed: {}", label, e),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("Kill of {} skipped: {}", label, e);
    }
}
