//! tunnelrun Runner
//!
//! This crate is the control process of a tunnelled browser test run:
//! - Serves the site under test from an in-process HTTP server
//! - Opens a provider tunnel (BrowserStack, Sauce Labs, TestingBot) and waits
//!   until the provider says it is usable
//! - Fans the test suite out to worker subprocesses and folds their reports
//!   into pass/fail counts
//! - Tears everything down in reverse order, whichever stage failed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Orchestrator (control task)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  run() -> PipelineResult                                    │
//! │    ├── ServerStage::start    -> bound port                  │
//! │    ├── TunnelStage::start    -> tunnel id                   │
//! │    │     └── wait_ready(line | ready file, exit, timeout)   │
//! │    ├── WorkerStage::launch   (index + base64 config)        │
//! │    ├── select! { tunnel fault | interrupt | await_all }     │
//! │    └── teardown: halt_all -> tunnel stop -> server stop     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SupervisedChild                                            │
//! │    ├── ExitWatch      (watch channel, settles once)         │
//! │    └── terminate()    (SIGTERM, then kill)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Worker (tunnelrun-worker)                                  │
//! │    ├── expand partition globs                               │
//! │    ├── run test command per file                            │
//! │    └── @@tunnelrun-report {"failureCount": N}               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod logs;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod readiness;
pub mod server;
pub mod tunnel;
pub mod worker;

pub use error::{ControlError, ControlResult};
pub use orchestrator::{
    Orchestrator, PipelineResult, PipelineStage, ServerStage, TunnelStage, WorkerStage,
};
pub use pool::{PoolResult, WorkerPool, WorkerSpec, HALTED_EXIT_CODE};
pub use server::LocalServer;
pub use tunnel::{effective_config, ProviderProfile, TunnelManager};
pub use worker::WorkerInvocation;
