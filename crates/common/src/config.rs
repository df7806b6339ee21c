//! Run configuration
//!
//! The control process reads a TOML file into a [`RunConfig`]. Workers receive
//! the effective configuration (tunnel identifier and bound server port filled
//! in) as base64-encoded JSON on their command line, so every type here is
//! both TOML- and JSON-serializable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Remote test-execution provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    BrowserStack,
    SauceLabs,
    TestingBot,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [Self::BrowserStack, Self::SauceLabs, Self::TestingBot];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::BrowserStack => "browserstack",
            ServiceKind::SauceLabs => "saucelabs",
            ServiceKind::TestingBot => "testingbot",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidService(s.to_string()))
    }
}

/// A named account credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    User,
    Key,
    Secret,
}

impl Credential {
    pub fn as_str(&self) -> &'static str {
        match self {
            Credential::User => "user",
            Credential::Key => "key",
            Credential::Secret => "secret",
        }
    }
}

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Provider used for this run
    pub service: ServiceKind,

    /// Start the bundled static server; disable to test a server you run yourself
    pub launch_local_server: bool,

    /// Target web server
    pub server: ServerSettings,

    /// Log file locations
    pub log: LogSettings,

    /// Worker fan-out
    pub workers: WorkerSettings,

    pub browserstack: ProviderSettings,
    pub saucelabs: ProviderSettings,
    pub testingbot: ProviderSettings,

    /// Generated per run once the tunnel is up; never read from the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            service: ServiceKind::default(),
            launch_local_server: true,
            server: ServerSettings::default(),
            log: LogSettings::default(),
            workers: WorkerSettings::default(),
            browserstack: ProviderSettings::default(),
            saucelabs: ProviderSettings::default(),
            testingbot: ProviderSettings::default(),
            tunnel_id: None,
        }
    }
}

/// Local target server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub protocol: String,
    pub host: String,
    /// Port to listen on (0 = pick a free port at startup)
    pub port: u16,
    /// Directory served by the bundled server
    pub static_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 10080,
            static_dir: PathBuf::from("server/static"),
        }
    }
}

impl ServerSettings {
    /// URL the remote browser uses to reach the server through the tunnel
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Log file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Created if absent; relative paths resolve against the working directory
    pub directory: PathBuf,
    pub worker_log_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            worker_log_prefix: "test-process-".to_string(),
        }
    }
}

impl LogSettings {
    pub fn worker_log_path(&self, index: usize) -> PathBuf {
        self.directory
            .join(format!("{}{}.log", self.worker_log_prefix, index))
    }
}

/// Worker fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// One entry per worker; each entry lists the test file globs it runs
    pub partitions: Vec<Vec<String>>,

    /// Worker program and leading arguments. Empty means the `tunnelrun-worker`
    /// binary installed next to the control process.
    pub command: Vec<String>,

    /// Command run by a worker for each test file; `{file}` is substituted
    pub test_command: Vec<String>,

    /// Halt workers still running after this many seconds (unset = wait forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_run_secs: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            command: Vec::new(),
            test_command: vec!["node".to_string(), "{file}".to_string()],
            max_run_secs: None,
        }
    }
}

/// WebDriver endpoint workers talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeleniumEndpoint {
    pub host: String,
    pub port: u16,
}

impl SeleniumEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn webdriver_url(&self) -> String {
        format!("http://{}:{}/wd/hub", self.host, self.port)
    }
}

/// Per-provider account, endpoint and tunnel settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub user: Option<String>,
    pub key: Option<String>,
    pub secret: Option<String>,

    /// Overrides the provider's default WebDriver endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selenium: Option<SeleniumEndpoint>,

    /// Desired capabilities sent by workers when opening a remote session
    pub capabilities: Map<String, Value>,

    pub tunnel: TunnelSettings,
}

impl ProviderSettings {
    /// Credential value, treating an empty string as absent
    pub fn credential(&self, credential: Credential) -> Option<&str> {
        let value = match credential {
            Credential::User => self.user.as_deref(),
            Credential::Key => self.key.as_deref(),
            Credential::Secret => self.secret.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Tunnel executable settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Tunnel binary (or jar); defaults to the provider's conventional location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Log file name inside the log directory; defaults to `<service>.log`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logfile: Option<String>,

    /// Seconds to wait for the tunnel to report readiness
    pub timeout_secs: u64,

    /// Local port the tunnel exposes a Selenium endpoint on (ready-file providers)
    pub selenium_port: u16,

    /// Runtime that launches the tunnel, e.g. `["java", "-jar"]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<Vec<String>>,

    /// Ready-file poll interval in milliseconds
    pub ready_poll_ms: u64,

    /// Regex overriding the provider's "tunnel is up" output line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            path: None,
            logfile: None,
            timeout_secs: 120,
            selenium_port: 4445,
            interpreter: None,
            ready_poll_ms: 1000,
            ready_pattern: None,
        }
    }
}

impl RunConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would make the run meaningless before anything starts
    pub fn validate(&self) -> Result<()> {
        if self.workers.partitions.is_empty() {
            return Err(Error::InvalidConfig(
                "workers.partitions must list at least one worker".to_string(),
            ));
        }
        if let Some(index) = self.workers.partitions.iter().position(|p| p.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "workers.partitions[{}] has no test files",
                index
            )));
        }
        if self.workers.test_command.is_empty() {
            return Err(Error::InvalidConfig(
                "workers.test_command must not be empty".to_string(),
            ));
        }
        if self.workers.max_run_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "workers.max_run_secs must be positive when set".to_string(),
            ));
        }

        let tunnel = &self.provider().tunnel;
        if tunnel.timeout_secs == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}.tunnel.timeout_secs must be positive",
                self.service
            )));
        }
        if tunnel.ready_poll_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}.tunnel.ready_poll_ms must be positive",
                self.service
            )));
        }
        if matches!(&tunnel.interpreter, Some(argv) if argv.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "{}.tunnel.interpreter must name a program",
                self.service
            )));
        }
        Ok(())
    }

    /// Settings of the selected provider
    pub fn provider(&self) -> &ProviderSettings {
        match self.service {
            ServiceKind::BrowserStack => &self.browserstack,
            ServiceKind::SauceLabs => &self.saucelabs,
            ServiceKind::TestingBot => &self.testingbot,
        }
    }

    pub fn provider_mut(&mut self) -> &mut ProviderSettings {
        match self.service {
            ServiceKind::BrowserStack => &mut self.browserstack,
            ServiceKind::SauceLabs => &mut self.saucelabs,
            ServiceKind::TestingBot => &mut self.testingbot,
        }
    }

    /// Test file globs assigned to a worker
    pub fn partition(&self, index: usize) -> Option<&[String]> {
        self.workers.partitions.get(index).map(Vec::as_slice)
    }

    /// Serialize for a worker command line: base64 of the JSON form
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Inverse of [`RunConfig::encode`]
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("cannot render config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
