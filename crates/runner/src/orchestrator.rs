//! Run orchestration - server, tunnel, workers, teardown

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tunnelrun_common::RunConfig;

use crate::error::{ControlError, ControlResult};
use crate::pool::{PoolResult, WorkerPool, WorkerSpec};
use crate::server::LocalServer;
use crate::tunnel::{effective_config, TunnelManager};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    ServerStarting,
    ServerRunning,
    TunnelStarting,
    TunnelReady,
    WorkersRunning,
    TearingDown,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStage::ServerStarting => "server-starting",
            PipelineStage::ServerRunning => "server-running",
            PipelineStage::TunnelStarting => "tunnel-starting",
            PipelineStage::TunnelReady => "tunnel-ready",
            PipelineStage::WorkersRunning => "workers-running",
            PipelineStage::TearingDown => "tearing-down",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }

    /// Stages only move forward. Every run ends through `TearingDown`, and a
    /// finished run may only restart from the beginning.
    pub fn can_advance_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (*self, next) {
            (Done | Failed, ServerStarting) => true,
            (Done | Failed, _) => false,
            (TearingDown, Done | Failed) => true,
            (TearingDown, _) => false,
            (_, Done | Failed) => false,
            (current, next) => next > current,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one run
#[derive(Debug, Default)]
pub struct PipelineResult {
    /// Set when the orchestration itself failed; counts are then meaningless
    pub control_error: Option<ControlError>,
    pub incomplete_count: usize,
    pub failed_count: u64,
}

impl PipelineResult {
    fn from_pool(pool: PoolResult) -> Self {
        Self {
            control_error: None,
            incomplete_count: pool.incomplete_count,
            failed_count: pool.failed_count,
        }
    }

    fn failed(error: ControlError) -> Self {
        Self {
            control_error: Some(error),
            ..Default::default()
        }
    }

    pub fn passed(&self) -> bool {
        self.control_error.is_none() && self.incomplete_count == 0 && self.failed_count == 0
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Local target server stage
#[async_trait]
pub trait ServerStage: Send {
    /// Start serving. Returns the bound port, or `None` if the run targets an
    /// externally managed server.
    async fn start(&mut self, config: &RunConfig) -> ControlResult<Option<u16>>;

    async fn stop(&mut self) -> ControlResult<()>;
}

/// Provider tunnel stage
#[async_trait]
pub trait TunnelStage: Send {
    /// Start the tunnel and wait until it is ready; returns the tunnel id
    async fn start(&mut self, config: &RunConfig) -> ControlResult<String>;

    async fn stop(&mut self) -> ControlResult<()>;

    /// Resolves if a ready tunnel dies; pends otherwise
    async fn fault(&mut self) -> ControlError;

    fn take_pending_fault(&mut self) -> Option<ControlError>;
}

/// Worker fan-out stage
#[async_trait]
pub trait WorkerStage: Send {
    async fn launch(&mut self, specs: &[WorkerSpec], config: &RunConfig) -> ControlResult<()>;

    /// Wait for every launched worker to exit. Must be cancel-safe.
    async fn await_all(&mut self) -> PoolResult;

    fn halt_all(&mut self);
}

#[async_trait]
impl ServerStage for LocalServer {
    async fn start(&mut self, config: &RunConfig) -> ControlResult<Option<u16>> {
        if !config.launch_local_server {
            return Ok(None);
        }
        self.listen(&config.server).await.map(Some)
    }

    async fn stop(&mut self) -> ControlResult<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl TunnelStage for TunnelManager {
    async fn start(&mut self, config: &RunConfig) -> ControlResult<String> {
        TunnelManager::start(self, config).await
    }

    async fn stop(&mut self) -> ControlResult<()> {
        TunnelManager::stop(self).await
    }

    async fn fault(&mut self) -> ControlError {
        TunnelManager::fault(self).await
    }

    fn take_pending_fault(&mut self) -> Option<ControlError> {
        TunnelManager::take_pending_fault(self)
    }
}

#[async_trait]
impl WorkerStage for WorkerPool {
    async fn launch(&mut self, specs: &[WorkerSpec], config: &RunConfig) -> ControlResult<()> {
        WorkerPool::launch(self, specs, config).await
    }

    async fn await_all(&mut self) -> PoolResult {
        WorkerPool::await_all(self).await
    }

    fn halt_all(&mut self) {
        WorkerPool::halt_all(self)
    }
}

/// Which resources a run has started, and therefore must release
#[derive(Debug, Default, Clone, Copy)]
struct Started {
    server: bool,
    tunnel: bool,
    workers: bool,
}

/// Drives one run through its stages and tears down whatever was started
pub struct Orchestrator<S, T, W> {
    config: RunConfig,
    server: S,
    tunnel: T,
    workers: W,
    stage: PipelineStage,
    shutdown: CancellationToken,
}

impl Orchestrator<LocalServer, TunnelManager, WorkerPool> {
    /// Orchestrator wired to the real server, tunnel and worker stages
    pub fn from_config(config: RunConfig) -> ControlResult<Self> {
        let tunnel = TunnelManager::new(config.log.directory.clone());
        let workers = WorkerPool::from_config(&config)?;
        Ok(Self::new(config, LocalServer::new(), tunnel, workers))
    }
}

impl<S, T, W> Orchestrator<S, T, W>
where
    S: ServerStage,
    T: TunnelStage,
    W: WorkerStage,
{
    pub fn new(config: RunConfig, server: S, tunnel: T, workers: W) -> Self {
        Self {
            config,
            server,
            tunnel,
            workers,
            stage: PipelineStage::ServerStarting,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` interrupts a run and tears it down
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }

    pub fn workers(&self) -> &W {
        &self.workers
    }

    /// Run the whole pipeline. Never fails: control errors come back inside
    /// the result, after teardown has released everything that was started.
    pub async fn run(&mut self) -> PipelineResult {
        self.stage = PipelineStage::ServerStarting;
        debug!("Pipeline stage: {}", self.stage);

        let mut started = Started::default();
        let outcome = self.drive(&mut started).await;

        self.advance(PipelineStage::TearingDown);
        self.teardown(started).await;

        match outcome {
            Ok(pool) => {
                self.advance(PipelineStage::Done);
                PipelineResult::from_pool(pool)
            }
            Err(e) => {
                error!("Run failed: {}", e);
                self.advance(PipelineStage::Failed);
                PipelineResult::failed(e)
            }
        }
    }

    async fn drive(&mut self, started: &mut Started) -> ControlResult<PoolResult> {
        self.config.validate()?;
        let mut config = self.config.clone();

        let bound = until_shutdown(&self.shutdown, self.server.start(&config)).await?;
        match bound {
            Some(port) => {
                started.server = true;
                config.server.port = port;
                self.advance(PipelineStage::ServerRunning);
            }
            None => info!(
                "Local server disabled; testing against {}",
                config.server.base_url()
            ),
        }

        self.advance(PipelineStage::TunnelStarting);
        // An interrupted start may leave a tunnel process behind
        started.tunnel = true;
        let tunnel_id = until_shutdown(&self.shutdown, self.tunnel.start(&config)).await?;
        self.advance(PipelineStage::TunnelReady);

        let config = effective_config(&config, &tunnel_id);
        let specs = WorkerSpec::from_config(&config);

        // Partially launched pools still need halting
        started.workers = true;
        until_shutdown(&self.shutdown, self.workers.launch(&specs, &config)).await?;
        self.advance(PipelineStage::WorkersRunning);

        let pool = tokio::select! {
            biased;
            err = self.tunnel.fault() => return Err(err),
            () = self.shutdown.cancelled() => return Err(ControlError::Interrupted),
            pool = self.workers.await_all() => pool,
        };
        started.workers = false;

        // The tunnel may have died while the last workers were finishing
        if let Some(err) = self.tunnel.take_pending_fault() {
            return Err(err);
        }
        Ok(pool)
    }

    /// Release started resources in reverse order. Errors are logged only.
    async fn teardown(&mut self, started: Started) {
        if started.workers {
            self.workers.halt_all();
        }
        if started.tunnel {
            if let Err(e) = self.tunnel.stop().await {
                error!("Teardown: stopping tunnel failed: {}", e);
            }
        }
        if started.server {
            if let Err(e) = self.server.stop().await {
                error!("Teardown: stopping local server failed: {}", e);
            }
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal stage transition {} -> {}",
            self.stage,
            next
        );
        debug!("Pipeline stage: {} -> {}", self.stage, next);
        self.stage = next;
    }
}

async fn until_shutdown<T>(
    shutdown: &CancellationToken,
    stage: impl Future<Output = ControlResult<T>>,
) -> ControlResult<T> {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Err(ControlError::Interrupted),
        result = stage => result,
    }
}
