//! Downstream SSE sessions
//!
//! A session pairs the channel feeding a client's SSE stream with the channel
//! carrying that client's POSTed messages to its proxy task.

use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcMessage;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages buffered toward a client before the proxy waits for it
pub const CLIENT_BUFFER: usize = 256;

/// The proxy's side of one client connection
pub struct ClientStream {
    pub session_id: String,
    /// Messages the client POSTed
    pub inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    /// Messages for the client's event stream. Closed when the client goes away.
    pub outbound: mpsc::Sender<JsonRpcMessage>,
}

struct Session {
    backend: String,
    inbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    opened_at: Instant,
}

/// Open sessions keyed by id
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session for `backend`.
    ///
    /// Returns the proxy's end of the connection and the receiver feeding the
    /// client's event stream.
    pub fn open(&self, backend: &str) -> (ClientStream, mpsc::Receiver<JsonRpcMessage>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::channel(CLIENT_BUFFER);

        self.sessions.insert(
            session_id.clone(),
            Session {
                backend: backend.to_string(),
                inbound_tx,
                opened_at: Instant::now(),
            },
        );
        debug!(session_id, backend, "Session opened");

        let client = ClientStream {
            session_id,
            inbound,
            outbound,
        };
        (client, outbound_rx)
    }

    /// Hand a client message to the session's proxy
    pub fn deliver(&self, session_id: &str, message: JsonRpcMessage) -> Result<(), GatewayError> {
        let delivered = match self.sessions.get(session_id) {
            Some(session) => session.inbound_tx.send(message).is_ok(),
            None => return Err(GatewayError::SessionNotFound),
        };

        if !delivered {
            // The proxy already finished; forget the session
            self.remove(session_id);
            return Err(GatewayError::SessionNotFound);
        }
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                debug!(
                    session_id,
                    backend = %session.backend,
                    open_secs = session.opened_at.elapsed().as_secs(),
                    "Session removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn backend_of(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|s| s.backend.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
