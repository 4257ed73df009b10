//! Composition root: owns the backend registry, the session store and the router

use crate::config::{Config, ConfigSource};
use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcMessage;
use crate::process::BackendManager;
use crate::proxy::splice;
use crate::router::AggregationRouter;
use crate::session::SessionStore;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// A freshly opened session: its id and the messages destined for the client
pub struct SessionStream {
    pub session_id: String,
    pub messages: mpsc::Receiver<JsonRpcMessage>,
}

/// What happened to a POSTed message
#[derive(Debug, PartialEq)]
pub enum PostOutcome {
    /// Handed to a session's proxy; any reply arrives on the event stream
    Accepted,
    /// Answered directly by the router
    Answered(Value),
}

/// Backends touched by [`Gateway::reconcile`]
#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Running backends whose configured settings differ from the ones they started with
    pub changed: Vec<String>,
}

pub struct Gateway {
    manager: Arc<BackendManager>,
    sessions: Arc<SessionStore>,
    router: AggregationRouter,
    config: ConfigSource,
}

impl Gateway {
    pub fn new(manager: Arc<BackendManager>, config: ConfigSource) -> Arc<Self> {
        let router = AggregationRouter::new(manager.clone());
        Arc::new(Self {
            manager,
            sessions: SessionStore::new(),
            router,
            config,
        })
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn load_config(&self) -> Result<Arc<Config>, GatewayError> {
        self.config
            .load()
            .map_err(|e| GatewayError::Config(format!("{:#}", e)))
    }

    /// Start every configured backend. Failures are logged and skipped.
    ///
    /// Returns how many backends are running afterwards.
    pub fn start_all(&self, config: &Config) -> usize {
        for name in config.backend_names() {
            let Some(backend) = config.backend(&name) else {
                continue;
            };
            if let Err(e) = self.manager.start(&name, backend) {
                error!(backend = %name, error = %e, "Failed to start backend");
            }
        }
        let running = self.manager.len();
        info!(running, configured = config.mcp.servers.len(), "Backends started");
        running
    }

    /// Bring the running set in line with `config`.
    ///
    /// Backends no longer configured are stopped and configured ones that are not
    /// running are started. Changed settings apply on the next restart.
    pub async fn reconcile(&self, config: &Config) -> ReconcileResult {
        let mut result = ReconcileResult::default();

        for handle in self.manager.list_all() {
            if config.backend(handle.name()).is_none() {
                info!(backend = handle.name(), "Removing backend (config reload)");
                self.manager.stop(handle.name()).await;
                result.stopped.push(handle.name().to_string());
            }
        }

        for name in config.backend_names() {
            let Some(backend) = config.backend(&name) else {
                continue;
            };
            if let Some(handle) = self.manager.get(&name) {
                if handle.config() != backend {
                    info!(backend = %name, "Backend settings changed, applied on next restart");
                    result.changed.push(name);
                }
                continue;
            }
            match self.manager.start(&name, backend) {
                Ok(_) => result.started.push(name),
                Err(e) => error!(backend = %name, error = %e, "Failed to start backend"),
            }
        }

        result
    }

    /// Attach a new client session to `server`, starting the backend if needed
    pub fn open_session(&self, server: &str) -> Result<SessionStream, GatewayError> {
        let config = self.load_config()?;
        let backend = config
            .backend(server)
            .ok_or_else(|| GatewayError::ConfigNotFound(server.to_string()))?;

        let handle = self.manager.get_or_start(server, backend)?;
        let transport = handle
            .transport()
            .filter(|t| !t.is_closed())
            .ok_or_else(|| GatewayError::transport(server, "backend is not connected"))?;

        let (client, messages) = self.sessions.open(server);
        let session_id = client.session_id.clone();
        info!(backend = server, session_id, "New SSE connection");

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let session_id = client.session_id.clone();
            let closed_by = splice(client, transport).await;
            sessions.remove(&session_id);
            debug!(session_id, ?closed_by, "Session ended");
        });

        Ok(SessionStream {
            session_id,
            messages,
        })
    }

    /// Route a POSTed message: to its session when an id is given, else to the router
    pub async fn post_message(
        &self,
        session_id: Option<&str>,
        message: JsonRpcMessage,
    ) -> Result<PostOutcome, GatewayError> {
        match session_id {
            Some(session_id) => {
                self.sessions.deliver(session_id, message)?;
                Ok(PostOutcome::Accepted)
            }
            None => self.router.handle(&message).await.map(PostOutcome::Answered),
        }
    }

    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}
