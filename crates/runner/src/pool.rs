//! Worker pool
//!
//! One subprocess per test partition. Workers get their index and the
//! encoded run configuration on the command line and report back with a
//! single completion line on stdout. A worker counts as complete only if that
//! report arrived; its exit code alone says nothing about the tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunnelrun_common::{CompletionReport, RunConfig};

use crate::error::{ControlError, ControlResult};
use crate::logs::{ensure_log_dir, spawn_output_pump, LogFile};
use crate::process::{ExitOutcome, SupervisedChild};

/// Exit code recorded for a worker the control process halted
pub const HALTED_EXIT_CODE: i32 = 10;

/// Name of the worker binary looked up next to the control process
pub const WORKER_BINARY: &str = "tunnelrun-worker";

/// How long to keep reading a worker's stdout after it has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One worker's share of the test suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub index: usize,
    pub test_paths: Vec<String>,
}

impl WorkerSpec {
    /// One spec per configured partition, indexed in order
    pub fn from_config(config: &RunConfig) -> Vec<WorkerSpec> {
        config
            .workers
            .partitions
            .iter()
            .enumerate()
            .map(|(index, test_paths)| WorkerSpec {
                index,
                test_paths: test_paths.clone(),
            })
            .collect()
    }
}

/// Control-side record of one worker
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    process: Option<SupervisedChild>,
    completion_reported: bool,
    failure_count: Option<u32>,
    exit_code: Option<i32>,
    halted: bool,
    log_path: PathBuf,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Still running as far as the pool knows
    pub fn is_live(&self) -> bool {
        self.process.is_some()
    }

    pub fn completion_reported(&self) -> bool {
        self.completion_reported
    }

    pub fn failure_count(&self) -> Option<u32> {
        self.failure_count
    }

    /// `None` while running, or when the worker died from a signal
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Aggregate outcome of a worker fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolResult {
    /// Workers that never reported completion
    pub incomplete_count: usize,
    /// Sum of reported failure counts
    pub failed_count: u64,
}

impl PoolResult {
    pub fn from_handles<'a>(handles: impl IntoIterator<Item = &'a WorkerHandle>) -> Self {
        handles
            .into_iter()
            .fold(PoolResult::default(), |mut acc, handle| {
                if handle.completion_reported {
                    acc.failed_count += u64::from(handle.failure_count.unwrap_or(0));
                } else {
                    acc.incomplete_count += 1;
                }
                acc
            })
    }

    pub fn passed(&self) -> bool {
        self.incomplete_count == 0 && self.failed_count == 0
    }
}

#[derive(Debug)]
enum PoolEvent {
    Reported {
        index: usize,
        report: CompletionReport,
    },
    Exited {
        index: usize,
        outcome: ExitOutcome,
    },
}

/// Launches workers and folds their reports and exits into a [`PoolResult`]
pub struct WorkerPool {
    command: Vec<String>,
    max_run: Option<Duration>,
    deadline: Option<Instant>,
    handles: Vec<WorkerHandle>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
}

impl WorkerPool {
    /// Pool running `command` (program plus leading arguments) for each worker
    pub fn new(command: Vec<String>, max_run: Option<Duration>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            command,
            max_run,
            deadline: None,
            handles: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Pool using the configured worker command, or the worker binary
    /// installed alongside the running executable
    pub fn from_config(config: &RunConfig) -> ControlResult<Self> {
        let command = if config.workers.command.is_empty() {
            let exe = std::env::current_exe()?;
            let dir = exe.parent().unwrap_or_else(|| Path::new("."));
            let worker = dir.join(format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX));
            vec![worker.to_string_lossy().into_owned()]
        } else {
            config.workers.command.clone()
        };
        let max_run = config.workers.max_run_secs.map(Duration::from_secs);
        Ok(Self::new(command, max_run))
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn live_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_live()).count()
    }

    pub fn result(&self) -> PoolResult {
        PoolResult::from_handles(&self.handles)
    }

    /// Start one worker per spec.
    ///
    /// Stops at the first spawn failure; workers already started stay in the
    /// pool so they are halted with it.
    pub async fn launch(&mut self, specs: &[WorkerSpec], config: &RunConfig) -> ControlResult<()> {
        // A fresh channel keeps stragglers of an earlier launch out of this one
        self.halt_all();
        self.handles.clear();
        (self.events_tx, self.events_rx) = mpsc::unbounded_channel();

        ensure_log_dir(&config.log.directory)?;
        let encoded = config.encode()?;

        info!("Launching {} worker(s)", specs.len());
        for spec in specs {
            let handle = self.spawn_worker(spec, &encoded, config)?;
            self.handles.push(handle);
        }

        self.deadline = self.max_run.map(|limit| Instant::now() + limit);
        Ok(())
    }

    fn spawn_worker(
        &self,
        spec: &WorkerSpec,
        encoded: &str,
        config: &RunConfig,
    ) -> ControlResult<WorkerHandle> {
        let (program, leading) = self.command.split_first().ok_or_else(|| {
            ControlError::Config(tunnelrun_common::Error::InvalidConfig(
                "workers.command must name a program".to_string(),
            ))
        })?;

        let log = LogFile::create(config.log.worker_log_path(spec.index))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(spec.index.to_string())
            .arg(encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log.handle()?));

        let (process, stdout) = SupervisedChild::spawn(&mut cmd, format!("worker {}", spec.index))
            .map_err(|e| ControlError::spawn(format!("worker {} ({})", spec.index, program), e))?;

        info!(
            "Worker {} started (pid: {:?}, {} test path(s), log: {})",
            spec.index,
            process.pid(),
            spec.test_paths.len(),
            log.path().display()
        );

        let index = spec.index;
        let pump = match stdout {
            Some(stdout) => {
                let events = self.events_tx.clone();
                Some(spawn_output_pump(stdout, log.async_handle()?, move |line| {
                    match CompletionReport::parse_line(line) {
                        Ok(Some(report)) => {
                            let _ = events.send(PoolEvent::Reported { index, report });
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Worker {}: {}", index, e),
                    }
                }))
            }
            None => None,
        };

        let mut exit = process.exit_watch();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = exit.wait().await;
            // Reports written just before exit must be counted first
            if let Some(pump) = pump {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
                    debug!("Worker {} output still open after exit", index);
                }
            }
            let _ = events.send(PoolEvent::Exited { index, outcome });
        });

        Ok(WorkerHandle {
            index,
            process: Some(process),
            completion_reported: false,
            failure_count: None,
            exit_code: None,
            halted: false,
            log_path: log.path().to_path_buf(),
        })
    }

    /// Wait until no worker is live, halting stragglers at the run deadline.
    ///
    /// Cancel-safe: dropping the future loses no events.
    pub async fn await_all(&mut self) -> PoolResult {
        enum Wake {
            Event(Option<PoolEvent>),
            Deadline,
        }

        while self.live_count() > 0 {
            let wake = match self.deadline {
                Some(deadline) => tokio::select! {
                    event = self.events_rx.recv() => Wake::Event(event),
                    () = tokio::time::sleep_until(deadline) => Wake::Deadline,
                },
                None => Wake::Event(self.events_rx.recv().await),
            };

            match wake {
                Wake::Event(Some(event)) => self.apply(event),
                // The pool holds a sender, so the channel never closes
                Wake::Event(None) => break,
                Wake::Deadline => {
                    warn!(
                        "Run time limit reached with {} worker(s) still running",
                        self.live_count()
                    );
                    self.halt_all();
                }
            }
        }

        let result = self.result();
        info!(
            "All workers finished: {} incomplete, {} failed test(s)",
            result.incomplete_count, result.failed_count
        );
        result
    }

    fn apply(&mut self, event: PoolEvent) {
        let index = match &event {
            PoolEvent::Reported { index, .. } | PoolEvent::Exited { index, .. } => *index,
        };
        let Some(handle) = self.handles.iter_mut().find(|h| h.index == index) else {
            debug!("Event for unknown worker {}", index);
            return;
        };
        if handle.halted {
            debug!("Ignoring event from halted worker {}", index);
            return;
        }

        match event {
            PoolEvent::Reported { report, .. } => {
                if handle.completion_reported {
                    warn!("Worker {} reported completion again; keeping the first report", index);
                    return;
                }
                handle.completion_reported = true;
                handle.failure_count = Some(report.failure_count);
                info!("Worker {} completed with {} failure(s)", index, report.failure_count);
            }
            PoolEvent::Exited { outcome, .. } => {
                handle.process = None;
                handle.exit_code = outcome.code;
                if handle.completion_reported {
                    debug!("Worker {} exited ({})", index, outcome);
                } else {
                    warn!(
                        "Worker {} exited ({}) without reporting completion; see {}",
                        index,
                        outcome,
                        handle.log_path.display()
                    );
                }
            }
        }
    }

    /// Terminate every live worker. Anything they send afterwards is ignored.
    pub fn halt_all(&mut self) {
        for handle in self.handles.iter_mut() {
            if let Some(mut process) = handle.process.take() {
                info!("Halting worker {}", handle.index);
                process.terminate();
                handle.exit_code = Some(HALTED_EXIT_CODE);
                handle.halted = true;
            }
        }
    }
}
