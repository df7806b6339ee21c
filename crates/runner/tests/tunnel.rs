//! Tunnel manager against scripted stand-ins for the provider binaries

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tunnelrun_common::{RunConfig, ServiceKind};
use tunnelrun_runner::tunnel::Readiness;
use tunnelrun_runner::{ControlError, TunnelManager};

/// Tunnel that prints the BrowserStack banner and stays up
const LINE_READY: &str = r#"
echo "$$" > "$PIDFILE"
echo "BrowserStackLocal starting"
echo "You can now access your local server(s) in our remote browser"
exec sleep 30
"#;

/// Tunnel that touches its --readyfile and stays up
const FILE_READY: &str = r#"
echo "$$" > "$PIDFILE"
echo "$@" > "$ARGSFILE"
while [ $# -gt 0 ]; do
    case "$1" in
        --readyfile) ready="$2"; shift ;;
    esac
    shift
done
sleep 0.2
touch "$ready"
exec sleep 30
"#;

/// Tunnel that never signals readiness
const NEVER_READY: &str = r#"
echo "$$" > "$PIDFILE"
exec sleep 30
"#;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn log_dir(&self) -> PathBuf {
        self.path("logs")
    }

    /// Config running `script` under `sh` as the provider's tunnel binary
    fn config(&self, service: ServiceKind, script: &str) -> RunConfig {
        let script_path = self.path("tunnel.sh");
        let script = format!(
            "PIDFILE={}\nARGSFILE={}\n{}",
            self.path("tunnel.pid").display(),
            self.path("tunnel.args").display(),
            script
        );
        std::fs::write(&script_path, script).unwrap();

        let mut config = RunConfig::default();
        config.service = service;
        config.log.directory = self.log_dir();
        config.workers.partitions = vec![vec!["a.js".to_string()]];

        let provider = config.provider_mut();
        provider.user = Some("user".to_string());
        provider.key = Some("key".to_string());
        provider.secret = Some("secret".to_string());
        provider.tunnel.path = Some(script_path);
        provider.tunnel.interpreter = Some(vec!["sh".to_string()]);
        provider.tunnel.timeout_secs = 10;
        provider.tunnel.ready_poll_ms = 50;
        config
    }

    fn tunnel_pid(&self) -> Pid {
        let text = std::fs::read_to_string(self.path("tunnel.pid")).unwrap();
        Pid::from_raw(text.trim().parse().unwrap())
    }
}

fn is_running(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

async fn within<F: std::future::Future>(secs: u64, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("operation timed out")
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn browserstack_ready_on_output_line() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::BrowserStack, LINE_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    let tunnel_id = within(10, manager.start(&config)).await.unwrap();
    let handle = manager.handle().expect("tunnel is active");
    assert_eq!(handle.tunnel_id(), tunnel_id);
    assert_eq!(handle.readiness(), Readiness::Ready);
    assert_eq!(uuid::Uuid::parse_str(&tunnel_id).unwrap().get_version_num(), 4);

    let pid = fx.tunnel_pid();
    assert!(is_running(pid));

    within(10, manager.stop()).await.unwrap();
    assert!(manager.handle().is_none());
    assert!(!is_running(pid));
    assert!(manager.take_pending_fault().is_none());

    let log = read(&fx.log_dir().join("browserstack.log"));
    assert!(log.contains("BrowserStackLocal starting"));
    assert!(log.contains("You can now access your local server"));
}

#[tokio::test]
async fn saucelabs_ready_file_is_consumed() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::SauceLabs, FILE_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    let tunnel_id = within(10, manager.start(&config)).await.unwrap();

    let ready = fx.log_dir().join(format!("{}-ready", tunnel_id));
    assert!(!ready.exists());
    let args = read(&fx.path("tunnel.args"));
    assert_eq!(
        args.trim(),
        format!(
            "--user user --api-key key --tunnel-identifier {} --readyfile {} --se-port 4445",
            tunnel_id,
            ready.display()
        )
    );

    within(10, manager.stop()).await.unwrap();
}

#[tokio::test]
async fn testingbot_arguments_have_no_tunnel_identifier() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::TestingBot, FILE_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    let tunnel_id = within(10, manager.start(&config)).await.unwrap();
    let ready = fx.log_dir().join(format!("{}-ready", tunnel_id));
    let args = read(&fx.path("tunnel.args"));
    assert_eq!(
        args.trim(),
        format!("key secret --readyfile {} --se-port 4445", ready.display())
    );

    within(10, manager.stop()).await.unwrap();
}

#[tokio::test]
async fn exit_before_ready_is_not_a_timeout() {
    let fx = Fixture::new();
    let config = fx.config(
        ServiceKind::BrowserStack,
        "echo 'Authentication failed' >&2\nexit 2\n",
    );
    let mut manager = TunnelManager::new(fx.log_dir());

    let err = within(10, manager.start(&config)).await.unwrap_err();
    match err {
        ControlError::TunnelExitedBeforeReady { service, outcome } => {
            assert_eq!(service, ServiceKind::BrowserStack);
            assert_eq!(outcome.code, Some(2));
        }
        other => panic!("expected TunnelExitedBeforeReady, got {:?}", other),
    }
    assert!(manager.handle().is_none());
    assert!(read(&fx.log_dir().join("browserstack.log")).contains("Authentication failed"));
}

#[tokio::test]
async fn readiness_timeout_halts_the_tunnel() {
    let fx = Fixture::new();
    let mut config = fx.config(ServiceKind::SauceLabs, NEVER_READY);
    config.saucelabs.tunnel.timeout_secs = 1;
    let mut manager = TunnelManager::new(fx.log_dir());

    let err = within(10, manager.start(&config)).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::ReadinessTimeout {
            service: ServiceKind::SauceLabs,
            ..
        }
    ));
    assert!(manager.handle().is_none());
    assert!(!is_running(fx.tunnel_pid()));

    // Nothing left for a later stop to do
    within(5, manager.stop()).await.unwrap();
}

#[tokio::test]
async fn abandoned_start_is_halted_by_stop() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::SauceLabs, NEVER_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    // Give up on readiness early, as an interrupted run does
    let abandoned = tokio::time::timeout(Duration::from_millis(500), manager.start(&config)).await;
    assert!(abandoned.is_err());
    let pid = fx.tunnel_pid();
    assert!(is_running(pid));

    let err = manager.start(&config).await.unwrap_err();
    assert!(matches!(err, ControlError::TunnelAlreadyRunning { .. }));

    within(10, manager.stop()).await.unwrap();
    assert!(!is_running(pid));
    assert!(manager.take_pending_fault().is_none());
}

#[tokio::test]
async fn unexpected_exit_after_ready_is_a_fault() {
    let fx = Fixture::new();
    let script = r#"
echo "You can now access your local server(s) in our remote browser"
sleep 0.3
exit 4
"#;
    let config = fx.config(ServiceKind::BrowserStack, script);
    let mut manager = TunnelManager::new(fx.log_dir());
    within(10, manager.start(&config)).await.unwrap();

    match within(10, manager.fault()).await {
        ControlError::TunnelLost { service, outcome } => {
            assert_eq!(service, ServiceKind::BrowserStack);
            assert_eq!(outcome.code, Some(4));
        }
        other => panic!("expected TunnelLost, got {:?}", other),
    }
    within(5, manager.stop()).await.unwrap();
}

#[tokio::test]
async fn intentional_stop_never_faults() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::BrowserStack, LINE_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    for _ in 0..3 {
        within(10, manager.start(&config)).await.unwrap();
        within(10, manager.stop()).await.unwrap();

        assert!(manager.take_pending_fault().is_none());
        let fault = tokio::time::timeout(Duration::from_millis(200), manager.fault()).await;
        assert!(fault.is_err(), "stop reported a fault");
    }
}

#[tokio::test]
async fn one_tunnel_at_a_time() {
    let fx = Fixture::new();
    let config = fx.config(ServiceKind::BrowserStack, LINE_READY);
    let mut manager = TunnelManager::new(fx.log_dir());

    within(10, manager.start(&config)).await.unwrap();
    let err = manager.start(&config).await.unwrap_err();
    assert!(matches!(err, ControlError::TunnelAlreadyRunning { .. }));

    within(10, manager.stop()).await.unwrap();
}

#[tokio::test]
async fn missing_tunnel_binary_fails_to_spawn() {
    let fx = Fixture::new();
    let mut config = fx.config(ServiceKind::SauceLabs, NEVER_READY);
    config.saucelabs.tunnel.interpreter = None;
    config.saucelabs.tunnel.path = Some(fx.path("no-such-binary"));
    let mut manager = TunnelManager::new(fx.log_dir());

    let err = manager.start(&config).await.unwrap_err();
    assert!(matches!(err, ControlError::Spawn { .. }));
}
