//! Port and process registry for per-project worker servers.
//!
//! One worker process per project path, each bound to a port drawn from a
//! fixed range. The registry owns the child handles and reaps them when the
//! process exits and the worker stops answering.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use agent_relay_error::RelayError;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT_MIN: u16 = 14097;
pub const DEFAULT_PORT_MAX: u16 = 14200;
pub const DEFAULT_WORKER_PROGRAM: &str = "opencode";
pub const PORT_PLACEHOLDER: &str = "{port}";

const READY_POLL_INTERVAL_MS: u64 = 500;
const MONITOR_DELAY_MS: u64 = 500;
const LIVENESS_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct WorkerRegistryConfig {
    pub port_min: u16,
    pub port_max: u16,
    pub program: PathBuf,
    /// Arguments passed to `program`; every `{port}` is replaced by the allocated port.
    pub args: Vec<String>,
    pub log_dir: PathBuf,
}

impl Default for WorkerRegistryConfig {
    fn default() -> Self {
        Self {
            port_min: DEFAULT_PORT_MIN,
            port_max: DEFAULT_PORT_MAX,
            program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            args: default_worker_args(),
            log_dir: default_log_dir(),
        }
    }
}

pub fn default_worker_args() -> Vec<String> {
    vec![
        "serve".to_string(),
        "--port".to_string(),
        PORT_PLACEHOLDER.to_string(),
    ]
}

/// Snapshot of a tracked worker, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub project_path: PathBuf,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http_client: Client,
    config: WorkerRegistryConfig,
    spawn_locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    instances: HashMap<PathBuf, WorkerInstance>,
    reserved_ports: HashSet<u16>,
    next_generation: u64,
}

#[derive(Debug, Clone)]
struct WorkerInstance {
    port: u16,
    child: Arc<StdMutex<Option<Child>>>,
    started_at: DateTime<Utc>,
    generation: u64,
}

impl WorkerRegistry {
    pub fn new(config: WorkerRegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                http_client: Client::new(),
                config,
                spawn_locks: StdMutex::new(HashMap::new()),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &WorkerRegistryConfig {
        &self.inner.config
    }

    /// Returns the port of the worker serving `project_path`, starting one if needed.
    pub async fn spawn_worker(&self, project_path: impl AsRef<Path>) -> Result<u16, RelayError> {
        let project_path = project_path.as_ref().to_path_buf();
        let spawn_lock = self.spawn_lock(&project_path);
        let _guard = spawn_lock.lock().await;

        if let Some(port) = self.get_port(&project_path).await {
            return Ok(port);
        }

        let port = self.reserve_port().await?;
        let launched = self.launch(&project_path, port).await;

        let (child, generation) = {
            let mut state = self.inner.state.lock().await;
            state.reserved_ports.remove(&port);
            let child = launched?;
            state.next_generation += 1;
            let generation = state.next_generation;
            state.instances.insert(
                project_path.clone(),
                WorkerInstance {
                    port,
                    child: child.clone(),
                    started_at: Utc::now(),
                    generation,
                },
            );
            (child, generation)
        };

        info!(
            project = %project_path.display(),
            port,
            generation,
            "worker started"
        );
        self.spawn_monitor_task(project_path, generation, child);

        Ok(port)
    }

    pub async fn get_port(&self, project_path: impl AsRef<Path>) -> Option<u16> {
        let state = self.inner.state.lock().await;
        state
            .instances
            .get(project_path.as_ref())
            .map(|instance| instance.port)
    }

    pub async fn instances(&self) -> Vec<WorkerSummary> {
        let state = self.inner.state.lock().await;
        let mut summaries = state
            .instances
            .iter()
            .map(|(project_path, instance)| WorkerSummary {
                project_path: project_path.clone(),
                port: instance.port,
                started_at: instance.started_at,
            })
            .collect::<Vec<_>>();
        summaries.sort_by_key(|summary| summary.port);
        summaries
    }

    pub async fn stop_worker(&self, project_path: impl AsRef<Path>) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.instances.remove(project_path.as_ref())
        };
        self.release_spawn_lock(project_path.as_ref());

        match removed {
            Some(instance) => {
                reap_child(instance.child.clone()).await;
                info!(
                    project = %project_path.as_ref().display(),
                    port = instance.port,
                    "worker stopped"
                );
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained = {
            let mut state = self.inner.state.lock().await;
            state.instances.drain().collect::<Vec<_>>()
        };

        {
            let mut locks = match self.inner.spawn_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        for (project_path, instance) in drained {
            reap_child(instance.child.clone()).await;
            debug!(project = %project_path.display(), port = instance.port, "worker stopped");
        }
    }

    /// Polls the worker's liveness endpoint until it answers or `timeout` elapses.
    pub async fn wait_for_ready(&self, port: u16, timeout: Duration) -> Result<(), RelayError> {
        let url = session_url(port);
        let started = Instant::now();

        loop {
            match self
                .inner
                .http_client
                .get(&url)
                .timeout(Duration::from_millis(LIVENESS_TIMEOUT_MS))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => debug!(port, status = %response.status(), "worker not ready"),
                Err(err) => debug!(port, error = %err, "worker not reachable"),
            }

            if started.elapsed() >= timeout {
                return Err(RelayError::ReadinessTimeout {
                    port,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
        }
    }

    /// Single liveness check; any failure reads as "not responding".
    pub async fn is_responding(&self, port: u16) -> bool {
        matches!(
            self.inner
                .http_client
                .get(session_url(port))
                .timeout(Duration::from_millis(LIVENESS_TIMEOUT_MS))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }

    fn spawn_lock(&self, project_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = match self.inner.spawn_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(project_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the per-project spawn lock unless a spawn is holding it.
    fn release_spawn_lock(&self, project_path: &Path) {
        let mut locks = match self.inner.spawn_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks
            .get(project_path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(project_path);
        }
    }

    async fn reserve_port(&self) -> Result<u16, RelayError> {
        let mut state = self.inner.state.lock().await;
        let in_use = state
            .instances
            .values()
            .map(|instance| instance.port)
            .chain(state.reserved_ports.iter().copied())
            .collect::<HashSet<_>>();

        let (min, max) = (self.inner.config.port_min, self.inner.config.port_max);
        for port in min..=max {
            if in_use.contains(&port) {
                continue;
            }
            if is_port_available(port) {
                state.reserved_ports.insert(port);
                return Ok(port);
            }
        }

        Err(RelayError::NoPortAvailable { min, max })
    }

    async fn launch(
        &self,
        project_path: &Path,
        port: u16,
    ) -> Result<Arc<StdMutex<Option<Child>>>, RelayError> {
        let program = self.inner.config.program.clone();
        let program_display = program.display().to_string();
        let args = render_args(&self.inner.config.args, port);
        let log_dir = self.inner.config.log_dir.clone();
        let cwd = project_path.to_path_buf();

        let child = tokio::task::spawn_blocking(move || {
            let stderr = open_worker_log(&log_dir, port).unwrap_or_else(|_| Stdio::null());
            Command::new(&program)
                .args(&args)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(stderr)
                .spawn()
        })
        .await
        .map_err(|err| RelayError::WorkerSpawn {
            program: program_display.clone(),
            message: err.to_string(),
        })?
        .map_err(|err| RelayError::WorkerSpawn {
            program: program_display,
            message: err.to_string(),
        })?;

        Ok(Arc::new(StdMutex::new(Some(child))))
    }

    fn spawn_monitor_task(
        &self,
        project_path: PathBuf,
        generation: u64,
        child: Arc<StdMutex<Option<Child>>>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let polled = {
                    let mut guard = match child.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    match guard.as_mut() {
                        Some(child) => child.try_wait(),
                        None => return,
                    }
                };

                match polled {
                    Ok(Some(status)) => {
                        registry
                            .handle_process_exit(&project_path, generation, status)
                            .await;
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        registry
                            .handle_process_error(&project_path, generation, err)
                            .await;
                        return;
                    }
                }

                sleep(Duration::from_millis(MONITOR_DELAY_MS)).await;
            }
        });
    }

    async fn handle_process_exit(&self, project_path: &Path, generation: u64, status: ExitStatus) {
        let port = {
            let state = self.inner.state.lock().await;
            match state.instances.get(project_path) {
                Some(instance) if instance.generation == generation => instance.port,
                _ => return,
            }
        };

        // A supervising wrapper may have restarted the worker on the same port.
        if self.is_responding(port).await {
            info!(
                project = %project_path.display(),
                port,
                status = ?status,
                "worker process exited but port still responds; keeping registration"
            );
            return;
        }

        let mut state = self.inner.state.lock().await;
        if state
            .instances
            .get(project_path)
            .map(|instance| instance.generation == generation)
            .unwrap_or(false)
        {
            state.instances.remove(project_path);
            warn!(
                project = %project_path.display(),
                port,
                status = ?status,
                "worker exited"
            );
        }
    }

    async fn handle_process_error(
        &self,
        project_path: &Path,
        generation: u64,
        err: std::io::Error,
    ) {
        let mut state = self.inner.state.lock().await;
        if state
            .instances
            .get(project_path)
            .map(|instance| instance.generation == generation)
            .unwrap_or(false)
        {
            state.instances.remove(project_path);
            warn!(
                project = %project_path.display(),
                error = %err,
                "worker process error; registration dropped"
            );
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(WorkerRegistryConfig::default())
    }
}

fn session_url(port: u16) -> String {
    format!("http://localhost:{port}/session")
}

fn render_args(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
        .collect()
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn default_log_dir() -> PathBuf {
    let mut base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.push("agent-relay");
    base.push("worker-logs");
    base
}

fn open_worker_log(log_dir: &Path, port: u16) -> Result<Stdio, String> {
    fs::create_dir_all(log_dir).map_err(|err| err.to_string())?;
    let path = log_dir.join(format!("worker-{port}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| err.to_string())?;
    Ok(file.into())
}

/// Kills and waits for the child off the async worker threads.
async fn reap_child(child: Arc<StdMutex<Option<Child>>>) {
    if let Err(err) = tokio::task::spawn_blocking(move || kill_child(&child)).await {
        warn!(error = %err, "failed to reap worker process");
    }
}

fn kill_child(child: &Arc<StdMutex<Option<Child>>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}
