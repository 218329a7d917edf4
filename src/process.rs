//! Process registry: the single owner of live `(server, variant)` entries
//!
//! A [`ProcessRegistry`] is a cheap handle to a registry task. The task owns
//! the entry map and is the only code that mutates it, so every mutation
//! happens-before the routing resync it triggers, and two operations on the
//! same key never interleave. Each spawned child is watched by its own
//! supervision task, which reports natural exits back over a channel instead
//! of touching the map.

use crate::domain::variant_domain;
use crate::error::SupervisorError;
use crate::logs::{self, LogSink};
use crate::ports::PortAllocator;
use crate::routing::{LiveRoute, RoutingSync};
use crate::store::{ConfigStore, ServerConfig};
use crate::variant::{find_variant, resolve_variants, Variant};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending requests buffered before callers wait on the registry
const COMMAND_BUFFER: usize = 64;

/// How long output pumps may keep draining after the process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Identity of one runtime entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RuntimeKey {
    pub server: String,
    pub variant: Option<String>,
}

impl RuntimeKey {
    pub fn new(server: &str, variant: Option<&str>) -> Self {
        Self {
            server: server.to_string(),
            variant: variant.map(str::to_string),
        }
    }
}

impl fmt::Display for RuntimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            Some(ref variant) => write!(f, "{}[{}]", self.server, variant),
            None => f.write_str(&self.server),
        }
    }
}

/// Settings the registry applies to every spawned process
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Root directory for per-key log files
    pub logs_dir: PathBuf,
    /// Address ports are probed on
    pub host: IpAddr,
    /// Environment variable carrying the assigned port
    pub port_env: String,
    /// Shell used to run server commands (`<shell> -c <command>`)
    pub shell: String,
    /// Time between the graceful signal and the forceful kill
    pub stop_grace_period: Duration,
}

impl RegistrySettings {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_env: "PORT".to_string(),
            shell: "sh".to_string(),
            stop_grace_period: Duration::from_secs(10),
        }
    }

    /// Set the stop grace period (builder pattern)
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }
}

/// Result of a start request
#[derive(Debug, Clone, Serialize)]
pub struct Started {
    pub key: RuntimeKey,
    pub process_id: u32,
    pub port: u16,
    /// True when the key was already live and nothing was spawned
    pub already_running: bool,
    /// Set when the routing push after this start failed
    pub routing_warning: Option<String>,
}

/// Result of a stop request
#[derive(Debug, Clone, Serialize)]
pub struct Stopped {
    pub key: RuntimeKey,
    /// False when the key was not live
    pub stopped: bool,
    /// Set when the routing push after this stop failed
    pub routing_warning: Option<String>,
}

/// Runtime status of one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub process_id: Option<u32>,
    pub port: Option<u16>,
    pub uptime_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
    pub variant: Option<String>,
    pub env_overrides: BTreeMap<String, String>,
}

impl RuntimeStatus {
    /// Status of a key with no live entry
    pub fn not_running(variant: Option<String>) -> Self {
        Self {
            running: false,
            process_id: None,
            port: None,
            uptime_ms: None,
            started_at: None,
            log_path: None,
            variant,
            env_overrides: BTreeMap::new(),
        }
    }
}

/// One row of the listing: a declared variant joined with its live status
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub variant: Option<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub domain: String,
    pub status: RuntimeStatus,
}

/// Handle to the process registry task
#[derive(Clone)]
pub struct ProcessRegistry {
    commands: mpsc::Sender<Request>,
    logs_dir: PathBuf,
}

impl ProcessRegistry {
    /// Spawn the registry task and return a handle to it.
    ///
    /// The task runs until every handle is dropped, then terminates any
    /// processes still live.
    pub fn spawn(
        store: Arc<dyn ConfigStore>,
        routing: Arc<RoutingSync>,
        settings: RegistrySettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let logs_dir = settings.logs_dir.clone();

        let actor = RegistryActor {
            store,
            routing,
            ports: PortAllocator::new(settings.host),
            settings,
            entries: HashMap::new(),
            next_generation: 0,
            exits: exits_tx,
            closing: false,
        };
        tokio::spawn(actor.run(commands_rx, exits_rx));

        Self {
            commands: commands_tx,
            logs_dir,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::RegistryClosed)?;
        rx.await.map_err(|_| SupervisorError::RegistryClosed)
    }

    /// Start one key. Idempotent: a live key returns its existing assignment.
    pub async fn start(&self, name: &str, variant: Option<&str>) -> Result<Started, SupervisorError> {
        let key = RuntimeKey::new(name, variant);
        self.request(|reply| Request::Start { key, reply }).await?
    }

    /// Start every declared variant of a server
    pub async fn start_all_variants(&self, name: &str) -> Result<Vec<Started>, SupervisorError> {
        let server = name.to_string();
        let variants = self
            .request(|reply| Request::Variants { server, reply })
            .await??;

        let starts = variants.iter().map(|v| self.start(name, v.value.as_deref()));
        join_all(starts).await.into_iter().collect()
    }

    /// Stop one key, waiting until its process has exited
    pub async fn stop(&self, name: &str, variant: Option<&str>) -> Result<Stopped, SupervisorError> {
        self.stop_key(RuntimeKey::new(name, variant)).await
    }

    async fn stop_key(&self, key: RuntimeKey) -> Result<Stopped, SupervisorError> {
        let request_key = key.clone();
        let pending = self
            .request(|reply| Request::Stop {
                key: request_key,
                reply,
            })
            .await?;

        finish_stop(key, pending).await
    }

    async fn stop_keys(&self, keys: Vec<RuntimeKey>) -> Result<Vec<Stopped>, SupervisorError> {
        let stops = keys.into_iter().map(|key| self.stop_key(key));
        join_all(stops).await.into_iter().collect()
    }

    /// Concurrently stop every live variant of a server
    pub async fn stop_all_variants(&self, name: &str) -> Result<Vec<Stopped>, SupervisorError> {
        let server = Some(name.to_string());
        let keys = self.request(|reply| Request::LiveKeys { server, reply }).await?;
        self.stop_keys(keys).await
    }

    /// Concurrently stop every live key
    pub async fn stop_all(&self) -> Result<Vec<Stopped>, SupervisorError> {
        let keys = self.live_keys().await?;
        self.stop_keys(keys).await
    }

    /// Stop every live key and refuse any later start.
    ///
    /// Requests already queued behind this one still run, but a start
    /// among them fails with [`SupervisorError::RegistryClosed`].
    pub async fn shutdown(&self) -> Result<Vec<Stopped>, SupervisorError> {
        let pending = self.request(|reply| Request::Shutdown { reply }).await?;
        let stops = pending
            .into_iter()
            .map(|(key, pending)| finish_stop(key, pending));
        join_all(stops).await.into_iter().collect()
    }

    /// Stop then start. Not atomic: a failed start leaves the key down.
    pub async fn restart(&self, name: &str, variant: Option<&str>) -> Result<Started, SupervisorError> {
        self.stop(name, variant).await?;
        self.start(name, variant).await
    }

    /// Stop every live variant of a server, then start every declared one
    pub async fn restart_all_variants(&self, name: &str) -> Result<Vec<Started>, SupervisorError> {
        self.stop_all_variants(name).await?;
        self.start_all_variants(name).await
    }

    pub async fn status(&self, name: &str, variant: Option<&str>) -> Result<RuntimeStatus, SupervisorError> {
        let key = RuntimeKey::new(name, variant);
        self.request(|reply| Request::Status { key, reply }).await
    }

    /// Every declared variant of every server, with live status
    pub async fn all_status(&self) -> Result<Vec<ServerStatus>, SupervisorError> {
        self.request(|reply| Request::AllStatus { reply }).await?
    }

    /// Keys with a live entry, sorted
    pub async fn live_keys(&self) -> Result<Vec<RuntimeKey>, SupervisorError> {
        self.request(|reply| Request::LiveKeys { server: None, reply })
            .await
    }

    /// Last `lines` lines of a key's log file
    pub async fn read_log(
        &self,
        name: &str,
        variant: Option<&str>,
        lines: usize,
    ) -> Result<String, SupervisorError> {
        let key = RuntimeKey::new(name, variant);
        logs::read_tail(&self.logs_dir, &key, lines)
            .await
            .map_err(|source| SupervisorError::Log { key, source })
    }
}

async fn finish_stop(key: RuntimeKey, pending: PendingStop) -> Result<Stopped, SupervisorError> {
    if let Some(done) = pending.done {
        // A dropped sender means the process exited on its own first
        if let Ok(Err(reason)) = done.await {
            return Err(SupervisorError::Termination { key, reason });
        }
    }

    Ok(Stopped {
        key,
        stopped: pending.stopped,
        routing_warning: pending.routing_warning,
    })
}

enum Request {
    Start {
        key: RuntimeKey,
        reply: oneshot::Sender<Result<Started, SupervisorError>>,
    },
    Stop {
        key: RuntimeKey,
        reply: oneshot::Sender<PendingStop>,
    },
    Status {
        key: RuntimeKey,
        reply: oneshot::Sender<RuntimeStatus>,
    },
    AllStatus {
        reply: oneshot::Sender<Result<Vec<ServerStatus>, SupervisorError>>,
    },
    LiveKeys {
        server: Option<String>,
        reply: oneshot::Sender<Vec<RuntimeKey>>,
    },
    Variants {
        server: String,
        reply: oneshot::Sender<Result<Vec<Variant>, SupervisorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<(RuntimeKey, PendingStop)>>,
    },
}

/// Registry-side result of a stop; the caller awaits `done` for the exit
struct PendingStop {
    stopped: bool,
    routing_warning: Option<String>,
    done: Option<oneshot::Receiver<Result<(), String>>>,
}

/// Sent to a supervision task to terminate its process
struct StopRequest {
    done: oneshot::Sender<Result<(), String>>,
}

/// Sent by a supervision task when its process exits on its own
struct ExitNotice {
    key: RuntimeKey,
    generation: u64,
}

struct RuntimeEntry {
    /// Distinguishes successive entries for the same key
    generation: u64,
    process_id: u32,
    port: u16,
    started: Instant,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
    is_worktree: bool,
    env_overrides: BTreeMap<String, String>,
    control: oneshot::Sender<StopRequest>,
}

struct RegistryActor {
    store: Arc<dyn ConfigStore>,
    routing: Arc<RoutingSync>,
    settings: RegistrySettings,
    ports: PortAllocator,
    entries: HashMap<RuntimeKey, RuntimeEntry>,
    next_generation: u64,
    exits: mpsc::UnboundedSender<ExitNotice>,
    /// Set by a shutdown request; no start succeeds afterwards
    closing: bool,
}

impl RegistryActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Request>,
        mut exits: mpsc::UnboundedReceiver<ExitNotice>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(notice) = exits.recv() => self.handle_exit(notice).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        if !self.entries.is_empty() {
            info!(
                count = self.entries.len(),
                "Registry handles dropped, terminating remaining processes"
            );
        }
        // Dropping the entries closes each control channel, which the
        // supervision tasks treat as a stop request.
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Start { key, reply } => {
                let result = self.start(key).await;
                let _ = reply.send(result);
            }
            Request::Stop { key, reply } => {
                let pending = self.stop(key).await;
                let _ = reply.send(pending);
            }
            Request::Status { key, reply } => {
                let _ = reply.send(self.status(&key));
            }
            Request::AllStatus { reply } => {
                let _ = reply.send(self.all_status());
            }
            Request::LiveKeys { server, reply } => {
                let mut keys: Vec<RuntimeKey> = self
                    .entries
                    .keys()
                    .filter(|k| server.as_ref().map_or(true, |s| &k.server == s))
                    .cloned()
                    .collect();
                keys.sort();
                let _ = reply.send(keys);
            }
            Request::Variants { server, reply } => {
                let result = self.load_config(&server).map(|c| resolve_variants(&c));
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let pending = self.shutdown().await;
                let _ = reply.send(pending);
            }
        }
    }

    fn load_config(&self, name: &str) -> Result<ServerConfig, SupervisorError> {
        self.store
            .get(name)?
            .ok_or_else(|| SupervisorError::ServerNotFound(name.to_string()))
    }

    async fn start(&mut self, key: RuntimeKey) -> Result<Started, SupervisorError> {
        if self.closing {
            debug!(key = %key, "Start refused, registry is closing");
            return Err(SupervisorError::RegistryClosed);
        }
        if let Some(entry) = self.entries.get(&key) {
            debug!(key = %key, pid = entry.process_id, "Already running");
            return Ok(Started {
                process_id: entry.process_id,
                port: entry.port,
                key,
                already_running: true,
                routing_warning: None,
            });
        }

        let config = self.load_config(&key.server)?;
        let variant = find_variant(&config, key.variant.as_deref())?;
        let port = self.assign_port(&key, config.port)?;

        let log = LogSink::open(&self.settings.logs_dir, &key)
            .await
            .map_err(|source| SupervisorError::Log {
                key: key.clone(),
                source,
            })?;
        if let Err(e) = write_start_markers(&log, &config, &variant, port).await {
            debug!(key = %key, error = %e, "Failed to write start markers");
        }

        let child = match self.spawn_child(&config, &variant, port) {
            Ok(child) => child,
            Err(source) => {
                error!(key = %key, command = %config.command, error = %source, "Failed to spawn process");
                let _ = log.marker(&format!("ERROR: {}", source)).await;
                let _ = log.close().await;
                return Err(SupervisorError::Spawn { key, source });
            }
        };
        let process_id = child.id().unwrap_or(0);
        info!(key = %key, pid = process_id, port, "Process spawned");

        let generation = self.next_generation;
        self.next_generation += 1;

        let (control_tx, control_rx) = oneshot::channel();
        let supervisor = Supervisor {
            key: key.clone(),
            generation,
            log: log.clone(),
            grace: self.settings.stop_grace_period,
            exits: self.exits.clone(),
        };
        tokio::spawn(supervisor.run(child, control_rx));

        self.entries.insert(
            key.clone(),
            RuntimeEntry {
                generation,
                process_id,
                port,
                started: Instant::now(),
                started_at: Utc::now(),
                log_path: log.path().to_path_buf(),
                is_worktree: config.is_worktree(),
                env_overrides: variant.env_overrides,
                control: control_tx,
            },
        );

        let routing_warning = self.resync().await;
        Ok(Started {
            key,
            process_id,
            port,
            already_running: false,
            routing_warning,
        })
    }

    fn assign_port(&self, key: &RuntimeKey, fixed: Option<u16>) -> Result<u16, SupervisorError> {
        if let Some(port) = fixed.filter(|p| *p != 0) {
            if let Some((holder, _)) = self.entries.iter().find(|(_, e)| e.port == port) {
                return Err(SupervisorError::Allocation {
                    key: key.clone(),
                    reason: format!("fixed port {} is held by {}", port, holder),
                });
            }
            return Ok(port);
        }

        let in_use: HashSet<u16> = self.entries.values().map(|e| e.port).collect();
        self.ports
            .allocate(&in_use)
            .map_err(|reason| SupervisorError::Allocation {
                key: key.clone(),
                reason,
            })
    }

    fn spawn_child(
        &self,
        config: &ServerConfig,
        variant: &Variant,
        port: u16,
    ) -> std::io::Result<Child> {
        let mut cmd = shell_command(&self.settings.shell, &config.command);
        cmd.current_dir(&config.cwd)
            .envs(&config.env)
            .envs(&variant.env_overrides)
            .env(&self.settings.port_env, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole tree can be signalled
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    async fn stop(&mut self, key: RuntimeKey) -> PendingStop {
        let Some(entry) = self.entries.remove(&key) else {
            debug!(key = %key, "Stop requested for a key that is not running");
            return PendingStop {
                stopped: false,
                routing_warning: None,
                done: None,
            };
        };

        info!(key = %key, pid = entry.process_id, "Stopping process");
        let done = request_stop(entry);

        let routing_warning = self.resync().await;
        PendingStop {
            stopped: true,
            routing_warning,
            done: Some(done),
        }
    }

    /// Close the registry and stop every entry with a single resync
    async fn shutdown(&mut self) -> Vec<(RuntimeKey, PendingStop)> {
        self.closing = true;
        if self.entries.is_empty() {
            return Vec::new();
        }

        info!(count = self.entries.len(), "Registry closing, stopping all processes");
        let mut entries: Vec<(RuntimeKey, RuntimeEntry)> = self.entries.drain().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let signalled: Vec<_> = entries
            .into_iter()
            .map(|(key, entry)| (key, request_stop(entry)))
            .collect();

        let routing_warning = self.resync().await;
        signalled
            .into_iter()
            .map(|(key, done)| {
                let pending = PendingStop {
                    stopped: true,
                    routing_warning: routing_warning.clone(),
                    done: Some(done),
                };
                (key, pending)
            })
            .collect()
    }

    async fn handle_exit(&mut self, notice: ExitNotice) {
        let current = self
            .entries
            .get(&notice.key)
            .is_some_and(|e| e.generation == notice.generation);
        if !current {
            return;
        }

        self.entries.remove(&notice.key);
        warn!(key = %notice.key, "Process exited unexpectedly, entry removed");
        // Failures are logged by the synchronizer; nobody is waiting here
        let _ = self.resync().await;
    }

    async fn resync(&self) -> Option<String> {
        let routes: Vec<LiveRoute> = self
            .entries
            .iter()
            .map(|(key, entry)| LiveRoute {
                key: key.clone(),
                is_worktree: entry.is_worktree,
                port: entry.port,
            })
            .collect();
        self.routing.sync(&routes).await
    }

    fn status(&self, key: &RuntimeKey) -> RuntimeStatus {
        match self.entries.get(key) {
            Some(entry) => RuntimeStatus {
                running: true,
                process_id: Some(entry.process_id),
                port: Some(entry.port),
                uptime_ms: Some(entry.started.elapsed().as_millis() as u64),
                started_at: Some(entry.started_at),
                log_path: Some(entry.log_path.clone()),
                variant: key.variant.clone(),
                env_overrides: entry.env_overrides.clone(),
            },
            None => RuntimeStatus::not_running(key.variant.clone()),
        }
    }

    fn all_status(&self) -> Result<Vec<ServerStatus>, SupervisorError> {
        let tld = self.routing.tld();
        let mut rows = Vec::new();

        for config in self.store.list()? {
            let is_worktree = config.is_worktree();
            for variant in resolve_variants(&config) {
                let key = RuntimeKey {
                    server: config.name.clone(),
                    variant: variant.value.clone(),
                };
                rows.push(ServerStatus {
                    domain: variant_domain(&config.name, is_worktree, variant.value.as_deref(), tld),
                    status: self.status(&key),
                    variant: variant.value,
                    env_overrides: variant.env_overrides,
                    config: config.clone(),
                });
            }
        }
        Ok(rows)
    }
}

fn request_stop(entry: RuntimeEntry) -> oneshot::Receiver<Result<(), String>> {
    let (done_tx, done_rx) = oneshot::channel();
    // Fails only if the supervisor already saw the process exit
    let _ = entry.control.send(StopRequest { done: done_tx });
    done_rx
}

fn shell_command(shell: &str, command_line: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command_line);
        cmd
    }

    #[cfg(not(unix))]
    {
        let _ = shell;
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
}

async fn write_start_markers(
    log: &LogSink,
    config: &ServerConfig,
    variant: &Variant,
    port: u16,
) -> std::io::Result<()> {
    log.marker(&format!("Starting: {}", config.command)).await?;
    log.marker(&format!("Port: {}", port)).await?;
    log.marker(&format!("CWD: {}", config.cwd.display())).await?;
    if let Some(ref value) = variant.value {
        log.marker(&format!("Variant: {}", value)).await?;
        let env = serde_json::to_string(&variant.env_overrides).unwrap_or_default();
        log.marker(&format!("Env: {}", env)).await?;
    }
    log.separator().await
}

/// Watches one child: pumps its output into the log and reports its end
struct Supervisor {
    key: RuntimeKey,
    generation: u64,
    log: LogSink,
    grace: Duration,
    exits: mpsc::UnboundedSender<ExitNotice>,
}

impl Supervisor {
    async fn run(self, mut child: Child, control: oneshot::Receiver<StopRequest>) {
        let pumps: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(pump_output(out, self.log.clone()))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(pump_output(err, self.log.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();

        tokio::select! {
            status = child.wait() => {
                drain_output(pumps).await;
                let summary = match status {
                    Ok(status) => describe_exit(&status),
                    Err(e) => format!("unknown status ({})", e),
                };
                warn!(key = %self.key, exit = %summary, "Process exited");
                let _ = self.log.marker(&format!("Exited with {}", summary)).await;
                let _ = self.log.close().await;
                let _ = self.exits.send(ExitNotice {
                    key: self.key,
                    generation: self.generation,
                });
            }
            request = control => {
                // A closed channel means the registry is gone; tear down anyway
                let done = request.ok().map(|r| r.done);
                let result = terminate(&mut child, self.grace).await;
                drain_output(pumps).await;

                let outcome = match result {
                    Ok(status) => {
                        let summary = describe_exit(&status);
                        info!(key = %self.key, exit = %summary, "Process stopped");
                        let _ = self.log.marker(&format!("Stopped, exited with {}", summary)).await;
                        Ok(())
                    }
                    Err(e) => {
                        error!(key = %self.key, error = %e, "Failed to terminate process");
                        let _ = self.log.marker(&format!("ERROR: termination failed: {}", e)).await;
                        Err(e.to_string())
                    }
                };
                let _ = self.log.close().await;
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
        }
    }
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, log: LogSink) {
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = log.write_raw(&buf[..n]).await {
                    debug!(path = %log.path().display(), error = %e, "Log write failed");
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

/// Wait briefly for output pumps; grandchildren holding the pipes open
/// must not keep the supervisor alive.
async fn drain_output(mut pumps: Vec<JoinHandle<()>>) {
    let joined = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, join_all(pumps.iter_mut())).await;
    if joined.is_err() {
        for pump in &pumps {
            pump.abort();
        }
    }
}

/// `code=<n|none> signal=<n|none>`
pub(crate) fn describe_exit(status: &ExitStatus) -> String {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let show = |v: Option<i32>| v.map_or_else(|| "none".to_string(), |n| n.to_string());
    format!("code={} signal={}", show(status.code()), show(signal))
}

/// Terminate a child and its process group.
///
/// Sends SIGTERM to the group and waits up to `grace` for the leader to
/// exit, then SIGKILLs the group. A rejected SIGTERM escalates at once.
/// Group members that outlive the leader are killed either way.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    #[cfg(unix)]
    {
        let pgid = pid as libc::pid_t;
        if let Err(e) = signal_group(pgid, libc::SIGTERM) {
            if e.raw_os_error() == Some(libc::ESRCH) {
                return child.wait().await;
            }
            warn!(pid, error = %e, "Graceful termination rejected, killing");
            return force_kill(child, pgid).await;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => {
                let _ = signal_group(pgid, libc::SIGKILL);
                result
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_ms = grace.as_millis() as u64,
                    "Grace period exceeded, killing"
                );
                force_kill(child, pgid).await
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg takes plain integers and touches no memory of ours
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
async fn force_kill(child: &mut Child, pgid: libc::pid_t) -> std::io::Result<ExitStatus> {
    if let Err(e) = signal_group(pgid, libc::SIGKILL) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, error = %e, "Group kill failed, killing leader directly");
            child.start_kill()?;
        }
    }
    child.wait().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::routing::InMemoryProxy;
    use crate::store::{EnvSubdomains, MemoryStore};
    use tempfile::TempDir;

    struct Harness {
        registry: ProcessRegistry,
        proxy: Arc<InMemoryProxy>,
        store: Arc<MemoryStore>,
        dir: TempDir,
    }

    fn harness(configs: Vec<ServerConfig>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_configs(configs));
        let proxy = InMemoryProxy::new();
        let routing = RoutingSync::new(proxy.clone(), "localhost");
        let settings = RegistrySettings::new(dir.path().join("logs"))
            .with_grace_period(Duration::from_millis(500));
        let registry = ProcessRegistry::spawn(store.clone(), routing, settings);
        Harness {
            registry,
            proxy,
            store,
            dir,
        }
    }

    fn server(name: &str, command: &str) -> ServerConfig {
        ServerConfig::new(name, command, std::env::temp_dir())
    }

    async fn wait_for_log(registry: &ProcessRegistry, name: &str, variant: Option<&str>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let log = registry.read_log(name, variant, 200).await.unwrap();
            if log.contains(needle) || Instant::now() > deadline {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness(vec![server("web", "sleep 30")]);

        let first = h.registry.start("web", None).await.unwrap();
        let second = h.registry.start("web", None).await.unwrap();

        assert!(!first.already_running);
        assert!(second.already_running);
        assert_eq!(first.port, second.port);
        assert_eq!(first.process_id, second.process_id);
        assert_eq!(h.registry.live_keys().await.unwrap().len(), 1);

        h.registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_key_has_no_side_effects() {
        let h = harness(vec![server("web", "sleep 30")]);

        let stopped = h.registry.stop("web", None).await.unwrap();
        assert!(!stopped.stopped);
        assert_eq!(h.proxy.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_start_unknown_server() {
        let h = harness(vec![]);
        let result = h.registry.start("ghost", None).await;
        assert!(matches!(result, Err(SupervisorError::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_undeclared_variant() {
        let h = harness(vec![server("web", "sleep 30")
            .with_env_subdomains(EnvSubdomains::new().with("REGION", &["sg"]))]);

        let result = h.registry.start("web", Some("eu")).await;
        assert!(matches!(result, Err(SupervisorError::VariantNotFound { .. })));

        let result = h.registry.start("web", None).await;
        assert!(matches!(result, Err(SupervisorError::VariantRequired(_))));
        assert!(h.registry.live_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_removes_entry_and_route() {
        let h = harness(vec![server("web", "sleep 30")]);

        let started = h.registry.start("web", None).await.unwrap();
        assert_eq!(h.proxy.route("web.localhost"), Some(started.port));

        let stopped = h.registry.stop("web", None).await.unwrap();
        assert!(stopped.stopped);
        assert!(h.proxy.table().is_empty());

        let status = h.registry.status("web", None).await.unwrap();
        assert_eq!(status, RuntimeStatus::not_running(None));

        let log = h.registry.read_log("web", None, 50).await.unwrap();
        assert!(log.contains("Stopped, exited with"));
    }

    #[tokio::test]
    async fn test_variants_fan_out_and_tear_down() {
        let h = harness(vec![server("myapp", "sleep 30")
            .with_env_subdomains(EnvSubdomains::new().with("REGION", &["sg", "us"]))]);
        let before = h.proxy.table();

        let started = h.registry.start_all_variants("myapp").await.unwrap();
        assert_eq!(started.len(), 2);
        assert_ne!(started[0].port, started[1].port);
        assert_ne!(started[0].process_id, started[1].process_id);

        let table = h.proxy.table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("myapp.sg.localhost"), Some(&started[0].port));
        assert_eq!(table.get("myapp.us.localhost"), Some(&started[1].port));

        let stopped = h.registry.stop_all_variants("myapp").await.unwrap();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|s| s.stopped));
        assert_eq!(h.proxy.table(), before);
    }

    #[tokio::test]
    async fn test_variant_environment_is_injected() {
        let h = harness(vec![server(
            "myapp",
            "echo \"region=$REGION port=$PORT greeting=$GREETING\"; exec sleep 30",
        )
        .with_env("GREETING", "hello")
        .with_env_subdomains(EnvSubdomains::new().with("REGION", &["sg"]))]);

        let started = h.registry.start("myapp", Some("sg")).await.unwrap();
        let expected = format!("region=sg port={} greeting=hello", started.port);
        let log = wait_for_log(&h.registry, "myapp", Some("sg"), &expected).await;

        assert!(log.contains(&expected), "log was: {}", log);
        assert!(log.contains("Variant: sg"));
        assert!(log.contains(r#"Env: {"REGION":"sg"}"#));

        h.registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_removes_entry_and_route() {
        let h = harness(vec![server("flaky", "sleep 0.2; exit 3")]);

        h.registry.start("flaky", None).await.unwrap();
        assert!(h.registry.status("flaky", None).await.unwrap().running);

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.registry.status("flaky", None).await.unwrap().running {
            assert!(Instant::now() < deadline, "crash was never observed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(h.registry.live_keys().await.unwrap().is_empty());
        assert!(h.proxy.table().is_empty());
        let log = h.registry.read_log("flaky", None, 50).await.unwrap();
        assert!(log.contains("Exited with code=3"), "log was: {}", log);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_logged_and_surfaced() {
        let h = harness(vec![ServerConfig::new(
            "broken",
            "sleep 30",
            "/nonexistent/devgate/cwd",
        )]);

        let result = h.registry.start("broken", None).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
        assert!(h.registry.live_keys().await.unwrap().is_empty());

        let log = h.registry.read_log("broken", None, 50).await.unwrap();
        assert!(log.contains("ERROR:"), "log was: {}", log);
    }

    #[tokio::test]
    async fn test_fixed_port_conflict_is_an_allocation_failure() {
        let port = PortAllocator::default().allocate(&HashSet::new()).unwrap();
        let h = harness(vec![
            server("a", "sleep 30").with_port(port),
            server("b", "sleep 30").with_port(port),
        ]);

        let a = h.registry.start("a", None).await.unwrap();
        assert_eq!(a.port, port);

        let result = h.registry.start("b", None).await;
        assert!(matches!(result, Err(SupervisorError::Allocation { .. })));

        h.registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_routing_failure_does_not_roll_back_start() {
        let h = harness(vec![server("web", "sleep 30")]);
        h.proxy.set_fail_apply(true);

        let started = h.registry.start("web", None).await.unwrap();
        assert!(started.routing_warning.is_some());
        assert!(h.registry.status("web", None).await.unwrap().running);

        // The next mutation converges the proxy
        h.proxy.set_fail_apply(false);
        let stopped = h.registry.stop("web", None).await.unwrap();
        assert!(stopped.routing_warning.is_none());
        assert!(h.proxy.table().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_after_grace_period() {
        let h = harness(vec![server("stubborn", "trap '' TERM; sleep 30")]);

        h.registry.start("stubborn", None).await.unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let begun = Instant::now();
        let stopped = h.registry.stop("stubborn", None).await.unwrap();
        assert!(stopped.stopped);
        assert!(begun.elapsed() < Duration::from_secs(5));

        let log = h.registry.read_log("stubborn", None, 50).await.unwrap();
        assert!(log.contains("signal=9"), "log was: {}", log);
    }

    #[tokio::test]
    async fn test_restart_spawns_a_new_process() {
        let h = harness(vec![server("web", "sleep 30")]);

        let first = h.registry.start("web", None).await.unwrap();
        let second = h.registry.restart("web", None).await.unwrap();

        assert_ne!(first.process_id, second.process_id);
        assert!(!second.already_running);
        assert_eq!(h.registry.live_keys().await.unwrap().len(), 1);

        h.registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_restart_leaves_key_down() {
        let h = harness(vec![server("web", "sleep 30")]);
        h.registry.start("web", None).await.unwrap();

        h.store
            .put(ServerConfig::new("web", "sleep 30", "/nonexistent/devgate/cwd"))
            .unwrap();
        let result = h.registry.restart("web", None).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));

        let status = h.registry.status("web", None).await.unwrap();
        assert!(!status.running);
        assert!(h.proxy.table().is_empty());
    }

    #[tokio::test]
    async fn test_restart_all_variants_replaces_every_process() {
        let h = harness(vec![server("myapp", "sleep 30")
            .with_env_subdomains(EnvSubdomains::new().with("REGION", &["sg", "us"]))]);

        let first = h.registry.start_all_variants("myapp").await.unwrap();
        let second = h.registry.restart_all_variants("myapp").await.unwrap();

        assert_eq!(second.len(), 2);
        for (old, new) in first.iter().zip(&second) {
            assert_eq!(old.key, new.key);
            assert!(!new.already_running);
            assert_ne!(old.process_id, new.process_id);
        }
        let table = h.proxy.table();
        assert_eq!(table.get("myapp.sg.localhost"), Some(&second[0].port));
        assert_eq!(table.get("myapp.us.localhost"), Some(&second[1].port));

        h.registry.stop_all().await.unwrap();
    }

    /// Dead, or a zombie waiting for whoever adopted it to reap it
    fn process_gone(pid: libc::pid_t) -> bool {
        // SAFETY: signal 0 only probes for existence
        if unsafe { libc::kill(pid, 0) } != 0 {
            return true;
        }
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_stop_kills_the_whole_process_group() {
        let h = harness(vec![server(
            "tree",
            "(trap '' TERM; sleep 30) & echo \"child=$!\"; wait",
        )]);

        h.registry.start("tree", None).await.unwrap();
        let log = wait_for_log(&h.registry, "tree", None, "\nchild=").await;
        let child: libc::pid_t = log
            .lines()
            .find_map(|l| l.strip_prefix("child="))
            .and_then(|pid| pid.trim().parse().ok())
            .unwrap_or_else(|| panic!("no child pid in log: {}", log));
        assert!(!process_gone(child));

        h.registry.stop("tree", None).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_gone(child) {
            assert!(Instant::now() < deadline, "grandchild {} survived stop", child);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_refuses_starts() {
        let h = harness(vec![
            server("api", "sleep 30"),
            server("web", "sleep 30"),
        ]);
        h.registry.start("api", None).await.unwrap();
        h.registry.start("web", None).await.unwrap();

        let stopped = h.registry.shutdown().await.unwrap();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|s| s.stopped));
        assert!(h.proxy.table().is_empty());

        let result = h.registry.start("web", None).await;
        assert!(matches!(result, Err(SupervisorError::RegistryClosed)));
        assert!(h.registry.live_keys().await.unwrap().is_empty());

        // Closing twice is harmless
        assert!(h.registry.shutdown().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_status_matches_live_entries() {
        let h = harness(vec![
            server("api", "sleep 30"),
            server("myapp", "sleep 30")
                .with_env_subdomains(EnvSubdomains::new().with("REGION", &["sg", "us"])),
        ]);

        h.registry.start("api", None).await.unwrap();
        h.registry.start("myapp", Some("us")).await.unwrap();

        let rows = h.registry.all_status().await.unwrap();
        assert_eq!(rows.len(), 3);
        let running = rows.iter().filter(|r| r.status.running).count();
        assert_eq!(running, h.registry.live_keys().await.unwrap().len());

        let domains: Vec<_> = rows.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(
            domains,
            vec!["api.localhost", "myapp.sg.localhost", "myapp.us.localhost"]
        );

        h.registry.stop("api", None).await.unwrap();
        let rows = h.registry.all_status().await.unwrap();
        assert_eq!(rows.iter().filter(|r| r.status.running).count(), 1);

        h.registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_changes_apply_on_next_start() {
        let h = harness(vec![server("web", "sleep 30")]);
        assert!(h.dir.path().exists());

        h.store
            .put(server("web", "echo second-config; exec sleep 30"))
            .unwrap();
        h.registry.start("web", None).await.unwrap();
        let log = wait_for_log(&h.registry, "web", None, "second-config").await;
        assert!(log.contains("second-config"));

        h.registry.stop_all().await.unwrap();
    }
}
