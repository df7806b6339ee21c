//! Local target server - the static site remote browsers reach through the tunnel

use axum::routing::get;
use axum::Router;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tunnelrun_common::ServerSettings;

use crate::error::{ControlError, ControlResult};

/// How long in-flight requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running in-process HTTP server
pub struct ServerHandle {
    pub base_url: String,
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Bind and start serving `settings.static_dir`.
    ///
    /// Port 0 binds an ephemeral port; the bound port is reported back.
    pub async fn spawn(settings: &ServerSettings) -> ControlResult<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| ControlError::bind(addr.clone(), e))?;
        let port = listener.local_addr()?.port();

        let base_url = ServerSettings {
            port,
            ..settings.clone()
        }
        .base_url();

        info!(
            "Serving {} at {}",
            settings.static_dir.display(),
            base_url
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(&settings.static_dir);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            base_url,
            port,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop accepting connections and wait for the server task to finish
    pub async fn stop(mut self) -> ControlResult<()> {
        info!("Stopping local server on port {}", self.port);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => {
                debug!("Local server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(ControlError::Server(e.to_string())),
            Ok(Err(join)) => Err(ControlError::Server(join.to_string())),
            Err(_) => {
                warn!("Local server did not drain within {:?}; aborting", SHUTDOWN_GRACE);
                self.task.abort();
                Ok(())
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn router(static_dir: &Path) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
}

/// The optional local server stage of a run
#[derive(Default)]
pub struct LocalServer {
    handle: Option<ServerHandle>,
}

impl LocalServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    /// Start serving; returns the bound port
    pub async fn listen(&mut self, settings: &ServerSettings) -> ControlResult<u16> {
        if let Some(handle) = &self.handle {
            return Ok(handle.port);
        }
        let handle = ServerHandle::spawn(settings).await?;
        let port = handle.port;
        self.handle = Some(handle);
        Ok(port)
    }

    pub async fn shutdown(&mut self) -> ControlResult<()> {
        match self.handle.take() {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }
}
