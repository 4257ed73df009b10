use crate::config::BackendConfig;
use crate::error::GatewayError;
use crate::router::BackendSource;
use crate::transport::BackendTransport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable holding a JSON object merged into every backend's environment
pub const ENV_OVERRIDES_VAR: &str = "MCP_ENV_VARS";

/// Variables inherited from the gateway's own environment
#[cfg(unix)]
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(not(unix))]
const INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// A running backend as seen by the rest of the gateway
pub struct BackendHandle {
    name: String,
    config: BackendConfig,
    instance: u64,
    pid: Option<u32>,
    started_at: Instant,
    transport: RwLock<Option<Arc<BackendTransport>>>,
}

impl BackendHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The attached transport, if it has not been detached by a stop
    pub fn transport(&self) -> Option<Arc<BackendTransport>> {
        self.transport.read().clone()
    }

    fn detach_transport(&self) -> Option<Arc<BackendTransport>> {
        self.transport.write().take()
    }
}

/// Registry slot for a backend
struct BackendEntry {
    handle: Arc<BackendHandle>,
    /// Tells the supervisor to kill the child
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Lifecycle notifications from a backend's supervisor task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process exited on its own
    Exited {
        name: String,
        instance: u64,
        code: Option<i32>,
    },
    /// Waiting on the process failed
    Failed {
        name: String,
        instance: u64,
        error: String,
    },
}

/// Spawns and tracks backend tool servers.
///
/// Returned behind an `Arc` because each backend's supervisor task keeps a weak
/// reference back to the manager to report process exit.
pub struct BackendManager {
    /// Running backends keyed by configured name
    backends: DashMap<String, BackendEntry>,
    /// Environment every backend starts from
    base_env: HashMap<String, String>,
    call_timeout: Duration,
    next_instance: AtomicU64,
}

impl BackendManager {
    pub fn new(base_env: HashMap<String, String>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
            base_env,
            call_timeout,
            next_instance: AtomicU64::new(1),
        })
    }

    /// Manager using [`default_environment`] as the base environment
    pub fn with_default_environment(call_timeout: Duration) -> Arc<Self> {
        Self::new(default_environment(), call_timeout)
    }

    /// Spawn a backend and attach a transport to its stdio.
    ///
    /// Fails with [`GatewayError::BackendAlreadyRunning`] if `name` is registered.
    pub fn start(
        self: &Arc<Self>,
        name: &str,
        config: &BackendConfig,
    ) -> Result<Arc<BackendHandle>, GatewayError> {
        // The slot stays locked until the process is registered
        let slot = match self.backends.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(GatewayError::BackendAlreadyRunning(name.to_string())),
            Entry::Vacant(slot) => slot,
        };

        let env = self.build_env(config);
        let program = resolve_executable(&config.command, env.get("PATH").map(String::as_str));
        let args = config.split_args();

        info!(
            backend = name,
            command = %program.display(),
            args = ?args,
            "Starting backend"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::SpawnFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(GatewayError::SpawnFailed {
                name: name.to_string(),
                reason: "failed to capture process streams".to_string(),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        let pid = child.id();
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let transport = BackendTransport::open(name, stdout, stdin, self.call_timeout);

        let handle = Arc::new(BackendHandle {
            name: name.to_string(),
            config: config.clone(),
            instance,
            pid,
            started_at: Instant::now(),
            transport: RwLock::new(Some(transport)),
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(self),
            name.to_string(),
            instance,
            child,
            kill_rx,
        ));

        slot.insert(BackendEntry {
            handle: Arc::clone(&handle),
            kill_tx: Some(kill_tx),
            supervisor: Some(supervisor),
        });

        info!(backend = name, pid = ?pid, "Backend process spawned");
        Ok(handle)
    }

    /// Return the running backend, starting it first if needed
    pub fn get_or_start(
        self: &Arc<Self>,
        name: &str,
        config: &BackendConfig,
    ) -> Result<Arc<BackendHandle>, GatewayError> {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }
        match self.start(name, config) {
            // Lost a race with another start
            Err(GatewayError::BackendAlreadyRunning(_)) => self
                .get(name)
                .ok_or_else(|| GatewayError::transport(name, "backend exited during startup")),
            other => other,
        }
    }

    /// Stop a backend: close its transport, then kill the process.
    ///
    /// Unknown names are a no-op.
    pub async fn stop(&self, name: &str) {
        let Some((_, entry)) = self.backends.remove(name) else {
            debug!(backend = name, "Stop requested for backend that is not running");
            return;
        };

        info!(backend = name, "Stopping backend");
        let BackendEntry {
            handle,
            kill_tx,
            supervisor,
        } = entry;

        close_transport(&handle).await;

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(backend = name, error = %e, "Backend supervisor task failed");
            }
        }

        info!(backend = name, uptime_secs = handle.uptime().as_secs(), "Backend stopped");
    }

    /// Stop every registered backend concurrently
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "Stopping all backends");
        futures::future::join_all(names.iter().map(|name| self.stop(name))).await;
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendHandle>> {
        self.backends.get(name).map(|e| Arc::clone(&e.handle))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// All registered backends, ordered by name
    pub fn list_all(&self) -> Vec<Arc<BackendHandle>> {
        let mut handles: Vec<_> = self
            .backends
            .iter()
            .map(|e| Arc::clone(&e.handle))
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Apply a supervisor report. Events for a replaced instance are ignored.
    pub async fn handle_process_event(&self, event: ProcessEvent) {
        let (name, instance) = match &event {
            ProcessEvent::Exited {
                name,
                instance,
                code,
            } => {
                info!(backend = %name, code = ?code, "Backend process exited");
                (name, *instance)
            }
            ProcessEvent::Failed {
                name,
                instance,
                error,
            } => {
                error!(backend = %name, error = %error, "Backend process error");
                (name, *instance)
            }
        };

        let removed = self
            .backends
            .remove_if(name, |_, entry| entry.handle.instance == instance);

        match removed {
            // The supervisor is the caller here, so it is not awaited
            Some((_, entry)) => close_transport(&entry.handle).await,
            None => debug!(backend = %name, instance, "Ignoring event for stale backend instance"),
        }
    }

    fn build_env(&self, config: &BackendConfig) -> HashMap<String, String> {
        let mut env = self.base_env.clone();
        env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl BackendSource for BackendManager {
    fn live_backends(&self) -> Vec<(String, Arc<BackendTransport>)> {
        self.list_all()
            .into_iter()
            .filter_map(|handle| {
                let transport = handle.transport()?;
                (!transport.is_closed()).then(|| (handle.name.clone(), transport))
            })
            .collect()
    }
}

async fn close_transport(handle: &BackendHandle) {
    if let Some(transport) = handle.detach_transport() {
        if let Err(e) = transport.close().await {
            warn!(backend = %handle.name, error = %e, "Error closing backend transport");
        }
    }
}

/// Wait for the child to exit or for a kill request, then report back
async fn supervise(
    manager: Weak<BackendManager>,
    name: String,
    instance: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let event = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessEvent::Exited {
                name,
                instance,
                code: status.code(),
            },
            Err(e) => {
                let _ = child.start_kill();
                ProcessEvent::Failed {
                    name,
                    instance,
                    error: e.to_string(),
                }
            }
        },
        // Also fires if the registry entry is dropped without a stop
        _ = kill_rx => {
            match child.kill().await {
                Ok(()) => debug!(backend = %name, "Backend process killed"),
                Err(e) => warn!(backend = %name, error = %e, "Failed to kill backend process"),
            }
            return;
        }
    };

    if let Some(manager) = manager.upgrade() {
        manager.handle_process_event(event).await;
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(backend = %name, "stderr: {}", line.trim_end());
    }
}

/// The gateway's environment filtered to the variables backends inherit,
/// with `MCP_ENV_VARS` merged on top
pub fn default_environment() -> HashMap<String, String> {
    let mut env: HashMap<String, String> = INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        // Skip exported shell functions
        .filter(|(_, value)| !value.starts_with("()"))
        .collect();

    if let Ok(raw) = std::env::var(ENV_OVERRIDES_VAR) {
        match parse_env_overrides(&raw) {
            Ok(overrides) => env.extend(overrides),
            Err(e) => warn!(error = %e, "Ignoring invalid {}", ENV_OVERRIDES_VAR),
        }
    }

    env
}

/// Parse a JSON object of environment variables. Non-string values are stringified.
pub fn parse_env_overrides(raw: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    let values: HashMap<String, serde_json::Value> = serde_json::from_str(raw)?;
    Ok(values
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Resolve a command name through `path_var`.
///
/// Commands containing a path separator are used as given; names that cannot be
/// found are returned unchanged so the spawn error reports them.
pub fn resolve_executable(command: &str, path_var: Option<&str>) -> PathBuf {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.to_path_buf();
    }

    path_var
        .into_iter()
        .flat_map(std::env::split_paths)
        .flat_map(|dir| executable_names(command).into_iter().map(move |n| dir.join(n)))
        .find(|path| is_executable(path))
        .unwrap_or_else(|| candidate.to_path_buf())
}

#[cfg(unix)]
fn executable_names(command: &str) -> Vec<String> {
    vec![command.to_string()]
}

#[cfg(not(unix))]
fn executable_names(command: &str) -> Vec<String> {
    let mut names = vec![command.to_string()];
    if Path::new(command).extension().is_none() {
        names.extend([".exe", ".cmd", ".bat"].iter().map(|ext| format!("{}{}", command, ext)));
    }
    names
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
