//! Provider tunnel management
//!
//! Each provider ships its own tunnel binary with its own argument layout and
//! its own way of saying "ready". Those differences live in one
//! [`ProviderProfile`] record per provider; [`TunnelManager`] runs the same
//! start/wait/stop sequence for all of them.

use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnelrun_common::{Credential, ProviderSettings, RunConfig, SeleniumEndpoint, ServerSettings, ServiceKind};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};
use crate::logs::{ensure_log_dir, spawn_output_pump, LogFile};
use crate::process::{ExitOutcome, ExitWatch, SupervisedChild};
use crate::readiness::{wait_ready, ReadinessError, ReadySignal};

/// Line BrowserStackLocal prints once the tunnel accepts traffic
pub const BROWSERSTACK_READY_LINE: &str = "You can now access your local server";

const STOP_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How a provider's tunnel announces readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStrategy {
    /// A stdout line matching this pattern
    OutputPattern(&'static str),
    /// Creation of the file passed via `--readyfile`
    ReadyFile,
}

/// Everything that differs between providers
#[derive(Debug)]
pub struct ProviderProfile {
    pub service: ServiceKind,
    pub required: &'static [Credential],
    pub readiness: ReadinessStrategy,
    pub default_tunnel_path: &'static str,
    /// Program and arguments placed before the tunnel path (e.g. `java -jar`)
    pub default_interpreter: &'static [&'static str],
    pub default_selenium_host: &'static str,
    /// `None` means the tunnel's local Selenium port
    pub default_selenium_port: Option<u16>,
    /// Capability key receiving the tunnel identifier
    pub tunnel_capability: Option<&'static str>,
    /// Capability keys set to `true`
    pub flag_capabilities: &'static [&'static str],
    /// Capability keys receiving account credentials
    pub credential_capabilities: &'static [(&'static str, Credential)],
}

static BROWSERSTACK: ProviderProfile = ProviderProfile {
    service: ServiceKind::BrowserStack,
    required: &[Credential::User, Credential::Key],
    readiness: ReadinessStrategy::OutputPattern(BROWSERSTACK_READY_LINE),
    default_tunnel_path: "lib/BrowserStackLocal-2.0-linux-x64",
    default_interpreter: &[],
    default_selenium_host: "hub.browserstack.com",
    default_selenium_port: Some(80),
    tunnel_capability: Some("browserstack.tunnelIdentifier"),
    flag_capabilities: &["browserstack.tunnel"],
    credential_capabilities: &[
        ("browserstack.user", Credential::User),
        ("browserstack.key", Credential::Key),
    ],
};

static SAUCELABS: ProviderProfile = ProviderProfile {
    service: ServiceKind::SauceLabs,
    required: &[Credential::User, Credential::Key],
    readiness: ReadinessStrategy::ReadyFile,
    default_tunnel_path: "lib/sc-4.1-linux/bin/sc",
    default_interpreter: &[],
    default_selenium_host: "localhost",
    default_selenium_port: None,
    tunnel_capability: Some("tunnel-identifier"),
    flag_capabilities: &[],
    credential_capabilities: &[],
};

static TESTINGBOT: ProviderProfile = ProviderProfile {
    service: ServiceKind::TestingBot,
    required: &[Credential::Key, Credential::Secret],
    readiness: ReadinessStrategy::ReadyFile,
    default_tunnel_path: "lib/testingbot-tunnel-1.14/testingbot-tunnel.jar",
    default_interpreter: &["java", "-jar"],
    default_selenium_host: "localhost",
    default_selenium_port: None,
    tunnel_capability: None,
    flag_capabilities: &[],
    credential_capabilities: &[],
};

impl ProviderProfile {
    pub fn for_service(service: ServiceKind) -> &'static ProviderProfile {
        match service {
            ServiceKind::BrowserStack => &BROWSERSTACK,
            ServiceKind::SauceLabs => &SAUCELABS,
            ServiceKind::TestingBot => &TESTINGBOT,
        }
    }

    /// Fail on the first required credential that is absent or empty
    pub fn check_credentials(&self, settings: &ProviderSettings) -> ControlResult<()> {
        for credential in self.required {
            if settings.credential(*credential).is_none() {
                return Err(ControlError::MissingCredential {
                    service: self.service,
                    field: credential.as_str(),
                });
            }
        }
        Ok(())
    }

    pub fn tunnel_path(&self, settings: &ProviderSettings) -> PathBuf {
        settings
            .tunnel
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.default_tunnel_path))
    }

    pub fn log_path(&self, log_dir: &Path, settings: &ProviderSettings) -> PathBuf {
        match &settings.tunnel.logfile {
            Some(name) => log_dir.join(name),
            None => log_dir.join(format!("{}.log", self.service)),
        }
    }

    /// WebDriver endpoint workers should use
    pub fn selenium(&self, settings: &ProviderSettings) -> SeleniumEndpoint {
        settings.selenium.clone().unwrap_or_else(|| {
            SeleniumEndpoint::new(
                self.default_selenium_host,
                self.default_selenium_port
                    .unwrap_or(settings.tunnel.selenium_port),
            )
        })
    }

    /// Regex for the ready line; a configured pattern overrides the built-in one
    pub fn ready_pattern(&self, settings: &ProviderSettings) -> ControlResult<Option<Regex>> {
        let pattern = match (&settings.tunnel.ready_pattern, self.readiness) {
            (Some(custom), _) => custom.clone(),
            (None, ReadinessStrategy::OutputPattern(builtin)) => regex::escape(builtin),
            (None, ReadinessStrategy::ReadyFile) => return Ok(None),
        };
        Regex::new(&pattern).map(Some).map_err(|e| {
            ControlError::Config(tunnelrun_common::Error::InvalidConfig(format!(
                "{}.tunnel.ready_pattern: {}",
                self.service, e
            )))
        })
    }

    /// Tunnel arguments, credentials included. Never log the result.
    pub fn tunnel_args(
        &self,
        settings: &ProviderSettings,
        server: &ServerSettings,
        tunnel_id: &str,
        ready_file: Option<&Path>,
    ) -> Vec<String> {
        let cred = |c| settings.credential(c).unwrap_or_default().to_string();
        let ready = ready_file
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let se_port = settings.tunnel.selenium_port.to_string();

        match self.service {
            ServiceKind::BrowserStack => vec![
                cred(Credential::Key),
                format!("{},{},0", server.host, server.port),
                "-tunnelIdentifier".to_string(),
                tunnel_id.to_string(),
                "-onlyAutomate".to_string(),
                "-skipCheck".to_string(),
            ],
            ServiceKind::SauceLabs => vec![
                "--user".to_string(),
                cred(Credential::User),
                "--api-key".to_string(),
                cred(Credential::Key),
                "--tunnel-identifier".to_string(),
                tunnel_id.to_string(),
                "--readyfile".to_string(),
                ready,
                "--se-port".to_string(),
                se_port,
            ],
            ServiceKind::TestingBot => vec![
                cred(Credential::Key),
                cred(Credential::Secret),
                "--readyfile".to_string(),
                ready,
                "--se-port".to_string(),
                se_port,
            ],
        }
    }

    /// Program to exec plus its full argument list
    pub fn command_line(&self, settings: &ProviderSettings, args: Vec<String>) -> (String, Vec<String>) {
        let path = self.tunnel_path(settings).to_string_lossy().into_owned();
        let interpreter: Vec<String> = match &settings.tunnel.interpreter {
            Some(custom) => custom.clone(),
            None => self.default_interpreter.iter().map(|s| s.to_string()).collect(),
        };

        match interpreter.split_first() {
            Some((program, leading)) => {
                let mut argv = leading.to_vec();
                argv.push(path);
                argv.extend(args);
                (program.clone(), argv)
            }
            None => (path, args),
        }
    }

    /// Add the provider's tunnel capabilities
    pub fn decorate_capabilities(&self, settings: &mut ProviderSettings, tunnel_id: &str) {
        let mut additions = Vec::new();
        for key in self.flag_capabilities {
            additions.push((key.to_string(), Value::Bool(true)));
        }
        if let Some(key) = self.tunnel_capability {
            additions.push((key.to_string(), Value::String(tunnel_id.to_string())));
        }
        for (key, credential) in self.credential_capabilities {
            if let Some(value) = settings.credential(*credential) {
                additions.push((key.to_string(), Value::String(value.to_string())));
            }
        }
        settings.capabilities.extend(additions);
    }
}

/// The configuration workers receive: tunnel id recorded, capabilities decorated
pub fn effective_config(config: &RunConfig, tunnel_id: &str) -> RunConfig {
    let mut effective = config.clone();
    effective.tunnel_id = Some(tunnel_id.to_string());
    let profile = ProviderProfile::for_service(effective.service);
    profile.decorate_capabilities(effective.provider_mut(), tunnel_id);
    effective
}

/// Tunnel lifecycle as seen from the control process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// A launched tunnel process
#[derive(Debug)]
pub struct TunnelHandle {
    process: SupervisedChild,
    service: ServiceKind,
    tunnel_id: String,
    readiness: Readiness,
    timeout: Duration,
    log_path: PathBuf,
}

impl TunnelHandle {
    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Terminate and wait, logging while the tunnel takes its time
    async fn halt(&mut self) -> ExitOutcome {
        self.process.terminate();

        let started = Instant::now();
        let mut exit = self.process.exit_watch();
        let mut progress =
            tokio::time::interval_at(started + STOP_PROGRESS_INTERVAL, STOP_PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                outcome = exit.wait() => return outcome,
                _ = progress.tick() => {
                    info!(
                        "Still waiting for {} tunnel to exit ({}s)",
                        self.service,
                        started.elapsed().as_secs()
                    );
                }
            }
        }
    }
}

struct ActiveTunnel {
    handle: TunnelHandle,
    disarm: CancellationToken,
}

/// Starts, watches and stops at most one tunnel
pub struct TunnelManager {
    log_dir: PathBuf,
    active: Option<ActiveTunnel>,
    /// Spawned but not yet ready; kept here so an abandoned `start` can still be stopped
    starting: Option<TunnelHandle>,
    faults: Option<mpsc::Receiver<ControlError>>,
}

impl TunnelManager {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            active: None,
            starting: None,
            faults: None,
        }
    }

    /// The running tunnel, once it has become ready
    pub fn handle(&self) -> Option<&TunnelHandle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    /// Launch the configured provider's tunnel and wait until it is ready.
    ///
    /// Returns the tunnel identifier. On a readiness timeout the tunnel is
    /// halted before the error is returned, so a failed start never leaves a
    /// process behind.
    pub async fn start(&mut self, config: &RunConfig) -> ControlResult<String> {
        let running = self.active.as_ref().map(|a| &a.handle).or(self.starting.as_ref());
        if let Some(handle) = running {
            return Err(ControlError::TunnelAlreadyRunning {
                service: handle.service,
            });
        }

        let service = config.service;
        let profile = ProviderProfile::for_service(service);
        let settings = config.provider();
        profile.check_credentials(settings)?;
        let pattern = profile.ready_pattern(settings)?;

        let tunnel_id = Uuid::new_v4().to_string();
        ensure_log_dir(&self.log_dir)?;
        let log = LogFile::create(profile.log_path(&self.log_dir, settings))?;
        let ready_file = match profile.readiness {
            ReadinessStrategy::ReadyFile => Some(self.log_dir.join(format!("{}-ready", tunnel_id))),
            ReadinessStrategy::OutputPattern(_) => None,
        };

        let args = profile.tunnel_args(settings, &config.server, &tunnel_id, ready_file.as_deref());
        let (program, argv) = profile.command_line(settings, args);

        info!(
            "Launching {} tunnel. It might take a minute for a remote Selenium server to be ready...",
            service
        );
        debug!("Tunnel program: {} (log: {})", program, log.path().display());

        let mut cmd = Command::new(&program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stderr(Stdio::from(log.handle()?));
        if pattern.is_some() {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::from(log.handle()?));
        }

        let (process, stdout) = SupervisedChild::spawn(&mut cmd, format!("{} tunnel", service))
            .map_err(|e| ControlError::spawn(format!("{} tunnel ({})", service, program), e))?;

        let signal = match (pattern, ready_file) {
            (Some(pattern), _) => {
                let (line_tx, line_rx) = mpsc::unbounded_channel();
                if let Some(stdout) = stdout {
                    spawn_output_pump(stdout, log.async_handle()?, move |line| {
                        // Receiver goes away once readiness is decided
                        let _ = line_tx.send(line.to_string());
                    });
                }
                ReadySignal::OutputLine {
                    lines: line_rx,
                    pattern,
                }
            }
            (None, Some(path)) => ReadySignal::FileExists {
                path,
                interval: Duration::from_millis(settings.tunnel.ready_poll_ms),
            },
            (None, None) => {
                return Err(ControlError::Config(tunnelrun_common::Error::InvalidConfig(
                    format!("{} has no readiness signal", service),
                )))
            }
        };

        let timeout = Duration::from_secs(settings.tunnel.timeout_secs);
        let exit = process.exit_watch();
        self.starting = Some(TunnelHandle {
            process,
            service,
            tunnel_id: tunnel_id.clone(),
            readiness: Readiness::Pending,
            timeout,
            log_path: log.path().to_path_buf(),
        });

        let ready = wait_ready(signal, exit, timeout).await;
        let Some(mut handle) = self.starting.take() else {
            return Err(ControlError::Interrupted);
        };

        match ready {
            Ok(()) => {
                handle.readiness = Readiness::Ready;
                info!("{} tunnel launched and ready (id: {})", service, tunnel_id);

                let disarm = CancellationToken::new();
                let (fault_tx, fault_rx) = mpsc::channel(1);
                tokio::spawn(watch_for_loss(
                    service,
                    handle.process.exit_watch(),
                    disarm.clone(),
                    fault_tx,
                ));

                self.faults = Some(fault_rx);
                self.active = Some(ActiveTunnel { handle, disarm });
                Ok(tunnel_id)
            }
            Err(ReadinessError::ExitedBeforeReady(outcome)) => {
                handle.readiness = Readiness::Failed;
                error!(
                    "{} tunnel exited before it was ready ({}); see {}",
                    service,
                    outcome,
                    handle.log_path.display()
                );
                Err(ControlError::TunnelExitedBeforeReady { service, outcome })
            }
            Err(ReadinessError::TimedOut(timeout)) => {
                handle.readiness = Readiness::Failed;
                warn!(
                    "{} tunnel not ready after {:?}; halting it (log: {})",
                    service,
                    timeout,
                    handle.log_path.display()
                );
                let outcome = handle.halt().await;
                debug!("Timed-out {} tunnel halted ({})", service, outcome);
                Err(ControlError::ReadinessTimeout { service, timeout })
            }
        }
    }

    /// Halt the running tunnel. Does nothing when none is running.
    ///
    /// The exit watcher is disarmed first, so a requested shutdown is never
    /// reported as a lost tunnel. A tunnel whose `start` was abandoned before
    /// it became ready is halted and awaited too.
    pub async fn stop(&mut self) -> ControlResult<()> {
        if let Some(mut pending) = self.starting.take() {
            info!("Halting {} tunnel that never became ready...", pending.service);
            let outcome = pending.halt().await;
            info!("{} tunnel halted ({})", pending.service, outcome);
        }

        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        info!("Halting {} tunnel...", active.handle.service);
        active.disarm.cancel();
        self.faults = None;

        let outcome = active.handle.halt().await;
        info!("{} tunnel halted ({})", active.handle.service, outcome);
        Ok(())
    }

    /// Resolves when a ready tunnel exits on its own; pends forever otherwise
    pub async fn fault(&mut self) -> ControlError {
        if let Some(faults) = self.faults.as_mut() {
            if let Some(err) = faults.recv().await {
                return err;
            }
        }
        std::future::pending().await
    }

    /// A loss that has already been reported but not yet consumed
    pub fn take_pending_fault(&mut self) -> Option<ControlError> {
        self.faults.as_mut()?.try_recv().ok()
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        if let Some(pending) = self.starting.as_mut() {
            pending.process.terminate();
        }
        if let Some(active) = self.active.as_mut() {
            active.disarm.cancel();
            active.handle.process.terminate();
        }
    }
}

/// Report the tunnel's exit as a fault unless `disarm` fires first
async fn watch_for_loss(
    service: ServiceKind,
    mut exit: ExitWatch,
    disarm: CancellationToken,
    faults: mpsc::Sender<ControlError>,
) {
    tokio::select! {
        biased;
        () = disarm.cancelled() => {
            debug!("{} tunnel exit watcher disarmed", service);
        }
        outcome = exit.wait() => {
            error!("{} tunnel exited unexpectedly ({})", service, outcome);
            let _ = faults.send(ControlError::TunnelLost { service, outcome }).await;
        }
    }
}
