//! Daemon startup and shutdown sequencing
//!
//! Startup: liveness check, API bind, reverse proxy start, liveness marker.
//! Shutdown: stop every server, stop the proxy, remove the marker, close the
//! listener. A proxy that fails to start leaves the daemon in direct-access
//! mode: servers still run and are reachable on their ports, but no domain
//! routes are pushed.

use crate::api::{ApiServer, ApiState};
use crate::config::Config;
use crate::error::DaemonError;
use crate::process::ProcessRegistry;
use crate::proxy::CaddyProxy;
use crate::routing::{InMemoryProxy, ReverseProxy, RoutingSync};
use crate::store::{ConfigStore, FileStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const API_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of [`Daemon::start`]
pub enum Startup {
    Running(RunningDaemon),
    /// A live daemon already owns the liveness marker; nothing was started
    AlreadyRunning { pid: u32 },
}

pub struct Daemon {
    config: Config,
    store: Arc<dyn ConfigStore>,
    proxy: Arc<dyn ReverseProxy>,
}

impl Daemon {
    pub fn new(config: Config, store: Arc<dyn ConfigStore>, proxy: Arc<dyn ReverseProxy>) -> Self {
        Self { config, store, proxy }
    }

    /// File-backed store and Caddy, as configured
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(FileStore::new(config.servers_dir()));
        let proxy: Arc<dyn ReverseProxy> = if config.proxy.enabled {
            Arc::new(CaddyProxy::new(config.caddy_settings())?)
        } else {
            InMemoryProxy::new()
        };
        Ok(Self::new(config, store, proxy))
    }

    pub async fn start(self) -> Result<Startup, DaemonError> {
        let pid_file = self.config.pid_file();
        if let Some(pid) = live_marker_pid(&pid_file)? {
            info!(pid, path = %pid_file.display(), "Daemon already running");
            return Ok(Startup::AlreadyRunning { pid });
        }

        let addr = self
            .config
            .api_addr()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        let settings = self
            .config
            .registry_settings()
            .map_err(|e| DaemonError::Config(e.to_string()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })?;
        let api_addr = listener
            .local_addr()
            .map_err(|source| DaemonError::Bind { addr, source })?;

        let routing = RoutingSync::new(Arc::clone(&self.proxy), self.config.server.tld.clone());
        let registry = ProcessRegistry::spawn(Arc::clone(&self.store), Arc::clone(&routing), settings);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ApiState {
            registry: registry.clone(),
            routing: Arc::clone(&routing),
            log_tail_lines: self.config.supervisor.log_tail_lines,
        });
        let server = ApiServer::new(listener, state, shutdown_rx);
        let api_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "API server error");
            }
        });

        let proxy_running = if !self.config.proxy.enabled {
            info!("Reverse proxy disabled, running in direct-access mode");
            routing.set_enabled(false);
            false
        } else {
            match self.proxy.start().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        proxy = self.proxy.name(),
                        error = %e,
                        "Reverse proxy failed to start, continuing in direct-access mode"
                    );
                    routing.set_enabled(false);
                    false
                }
            }
        };

        let daemon = RunningDaemon {
            registry,
            routing,
            proxy: self.proxy,
            proxy_running,
            api_addr,
            pid_file,
            shutdown_tx,
            api_task,
        };

        if let Err(e) = write_marker(&daemon.pid_file) {
            error!(error = %e, "Failed to write liveness marker, shutting down");
            daemon.shutdown().await;
            return Err(e);
        }

        info!(
            api = %daemon.api_addr,
            tld = %self.config.server.tld,
            direct_access = !daemon.proxy_running,
            "Daemon started"
        );
        Ok(Startup::Running(daemon))
    }
}

pub struct RunningDaemon {
    registry: ProcessRegistry,
    routing: Arc<RoutingSync>,
    proxy: Arc<dyn ReverseProxy>,
    proxy_running: bool,
    api_addr: SocketAddr,
    pid_file: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    api_task: JoinHandle<()>,
}

impl RunningDaemon {
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingSync> {
        &self.routing
    }

    /// Address the API is actually bound to
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// True when no domain routes are pushed
    pub fn is_direct_access(&self) -> bool {
        !self.proxy_running
    }

    pub async fn shutdown(self) {
        info!("Stopping all servers...");
        match self.registry.shutdown().await {
            Ok(stopped) => info!(count = stopped.len(), "All servers stopped"),
            Err(e) => error!(error = %e, "Failed to stop every server"),
        }

        if self.proxy_running {
            if let Err(e) = self.proxy.stop().await {
                warn!(proxy = self.proxy.name(), error = %e, "Failed to stop reverse proxy");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.pid_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.pid_file.display(), error = %e, "Failed to remove liveness marker");
            }
        }

        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(API_SHUTDOWN_TIMEOUT, self.api_task).await.is_err() {
            warn!("API server did not stop in time");
        }

        info!("Shutdown complete");
    }
}

/// Pid recorded in the marker if that process is alive. Stale markers are removed.
fn live_marker_pid(path: &Path) -> Result<Option<u32>, DaemonError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::LivenessMarker {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match content.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Ok(Some(pid)),
        _ => {
            info!(path = %path.display(), "Removing stale liveness marker");
            if let Err(source) = std::fs::remove_file(path) {
                if source.kind() != std::io::ErrorKind::NotFound {
                    return Err(DaemonError::LivenessMarker {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

fn write_marker(path: &Path) -> Result<(), DaemonError> {
    let marker_error = |source| DaemonError::LivenessMarker {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(marker_error)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(marker_error)
}
