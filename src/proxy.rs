//! Caddy as the reverse proxy collaborator
//!
//! The daemon owns a `caddy run` child and drives it entirely through the
//! admin API: every routing push replaces the whole config via `POST /load`.

use crate::error::ProxyError;
use crate::process::terminate;
use crate::routing::{ReverseProxy, RoutingTable};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the HTTP server block inside the Caddy config
const SERVER_BLOCK: &str = "devgate";

const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CaddySettings {
    /// Caddy executable
    pub binary: String,
    /// Port Caddy serves routed domains on
    pub listen_port: u16,
    /// Admin API address (`host:port`)
    pub admin_addr: String,
    /// Serve routed domains over HTTPS with Caddy's internal issuer
    pub tls: bool,
    /// Upstream for requests matching no route (the daemon API)
    pub fallback_port: Option<u16>,
    /// Where the bootstrap config is written before launch
    pub config_path: PathBuf,
    pub startup_timeout: Duration,
}

pub struct CaddyProxy {
    settings: CaddySettings,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl CaddyProxy {
    pub fn new(settings: CaddySettings) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(ADMIN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Start(format!("failed to build admin client: {}", e)))?;

        Ok(Self {
            settings,
            client,
            child: Mutex::new(None),
        })
    }

    fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.settings.admin_addr, path)
    }

    /// Full Caddy JSON config routing every entry of `table`
    pub fn render_config(&self, table: &RoutingTable) -> Value {
        let mut routes: Vec<Value> = table
            .iter()
            .map(|(domain, port)| {
                json!({
                    "match": [{ "host": [domain] }],
                    "handle": [{
                        "handler": "reverse_proxy",
                        "upstreams": [{ "dial": format!("127.0.0.1:{}", port) }],
                    }],
                    "terminal": true,
                })
            })
            .collect();

        if let Some(port) = self.settings.fallback_port {
            routes.push(json!({
                "handle": [{
                    "handler": "reverse_proxy",
                    "upstreams": [{ "dial": format!("127.0.0.1:{}", port) }],
                }],
            }));
        }

        let mut server = json!({
            "listen": [format!(":{}", self.settings.listen_port)],
            "routes": routes,
        });
        if !self.settings.tls {
            server["automatic_https"] = json!({ "disable": true });
        }

        let mut config = json!({
            "admin": { "listen": self.settings.admin_addr },
            "apps": {
                "http": { "servers": { SERVER_BLOCK: server } },
            },
        });

        if self.settings.tls && !table.is_empty() {
            let subjects: Vec<&String> = table.keys().collect();
            config["apps"]["tls"] = json!({
                "automation": {
                    "policies": [{
                        "subjects": subjects,
                        "issuers": [{ "module": "internal" }],
                    }],
                },
            });
        }

        config
    }

    async fn admin_reachable(&self) -> bool {
        match self.client.get(self.admin_url("/config/")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn write_bootstrap_config(&self) -> Result<(), ProxyError> {
        let config = self.render_config(&RoutingTable::new());
        if let Some(parent) = self.settings.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| ProxyError::Start(format!("failed to render config: {}", e)))?;
        tokio::fs::write(&self.settings.config_path, body).await?;
        Ok(())
    }

    fn launch(&self) -> Result<Child, ProxyError> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("run")
            .arg("--config")
            .arg(&self.settings.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| {
            ProxyError::Start(format!("failed to launch '{}': {}", self.settings.binary, e))
        })
    }

    async fn wait_until_ready(&self, child: &mut Child) -> Result<(), ProxyError> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(ProxyError::Start(format!(
                    "caddy exited during startup ({})",
                    status
                )));
            }
            if self.admin_reachable().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::Start(format!(
                    "admin API at {} not reachable after {:?}",
                    self.settings.admin_addr, self.settings.startup_timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ReverseProxy for CaddyProxy {
    fn name(&self) -> &'static str {
        "caddy"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.write_bootstrap_config().await?;
        let mut child = self.launch()?;
        info!(
            binary = %self.settings.binary,
            pid = child.id().unwrap_or(0),
            admin = %self.settings.admin_addr,
            "Caddy launched"
        );

        if let Err(e) = self.wait_until_ready(&mut child).await {
            let _ = terminate(&mut child, STOP_TIMEOUT).await;
            return Err(e);
        }
        if let Err(e) = self.apply(&RoutingTable::new()).await {
            warn!(error = %e, "Initial Caddy config push failed, terminating");
            let _ = terminate(&mut child, STOP_TIMEOUT).await;
            return Err(e);
        }
        *guard = Some(child);
        drop(guard);

        info!(listen_port = self.settings.listen_port, tls = self.settings.tls, "Caddy ready");
        Ok(())
    }

    async fn apply(&self, table: &RoutingTable) -> Result<(), ProxyError> {
        let config = self.render_config(table);

        let response = self
            .client
            .post(self.admin_url("/load"))
            .json(&config)
            .send()
            .await
            .map_err(|e| ProxyError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Rejected { status, body });
        }

        debug!(routes = table.len(), "Caddy config loaded");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        if let Err(e) = self.client.post(self.admin_url("/stop")).send().await {
            debug!(error = %e, "Caddy admin stop request failed");
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Caddy stopped"),
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Err(_) => {
                warn!("Caddy did not stop via admin API, terminating");
                terminate(&mut child, STOP_TIMEOUT).await?;
            }
        }
        Ok(())
    }
}
