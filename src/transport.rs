//! Correlating JSON-RPC transport over a backend's stdio
//!
//! One [`BackendTransport`] wraps a newline-delimited JSON-RPC connection. Requests the
//! gateway issues get a fresh integer id and are tracked in a pending table; every inbound
//! message that does not answer one of them goes to each registered subscriber untouched.

use crate::error::GatewayError;
use crate::jsonrpc::{JsonRpcMessage, RequestId, JSONRPC_VERSION};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default window for a correlated call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// First id handed out; 0 is left to the aggregation sentinel
const FIRST_REQUEST_ID: i64 = 1;

/// How long `close` waits for an in-flight write before dropping the connection ungracefully
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What a subscriber sees from the underlying connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message that did not answer a pending call
    Message(JsonRpcMessage),
    /// A read or write failure; the connection may still be usable
    Error(String),
    /// The connection is gone. Sent once.
    Closed,
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<JsonRpcMessage>,
}

pub struct BackendTransport {
    name: String,
    timeout: Duration,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: DashMap<RequestId, PendingCall>,
    next_id: AtomicI64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    closed: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackendTransport {
    /// Wrap a raw connection and start reading from it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R, W>(name: &str, reader: R, writer: W, timeout: Duration) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        let transport = Arc::new(Self {
            name: name.to_string(),
            timeout,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending: DashMap::new(),
            next_id: AtomicI64::new(FIRST_REQUEST_ID),
            subscribers: Mutex::new(Vec::new()),
            closed,
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(Arc::downgrade(&transport), name.to_string(), reader));
        *transport.reader_task.lock() = Some(task);
        transport
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of correlated calls still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Add a pass-through subscriber. Every subscriber sees every uncorrelated event.
    ///
    /// Dropping the receiver unsubscribes. A subscriber added after close immediately
    /// receives [`TransportEvent::Closed`].
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        if self.is_closed() {
            let _ = tx.send(TransportEvent::Closed);
        } else {
            subscribers.push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Send a request and wait for its response.
    ///
    /// Any id already on the message is replaced with a fresh one.
    pub async fn send(self: &Arc<Self>, message: JsonRpcMessage) -> Result<JsonRpcMessage, GatewayError> {
        self.dispatch(message).await?.wait().await
    }

    /// Build and send a request for `method`
    pub async fn request(
        self: &Arc<Self>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<JsonRpcMessage, GatewayError> {
        self.send(JsonRpcMessage::request(0, method, params)).await
    }

    /// Write a request now and hand back a handle to await its response.
    ///
    /// Splitting the write from the wait keeps messages on the wire in call order while
    /// responses are awaited concurrently.
    pub async fn dispatch(
        self: &Arc<Self>,
        mut message: JsonRpcMessage,
    ) -> Result<PendingResponse, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::transport(&self.name, "connection closed"));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let method = message.method.clone().unwrap_or_default();
        message.id = Some(id.clone());
        message.jsonrpc = JSONRPC_VERSION.to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingCall {
                method: method.clone(),
                tx,
            },
        );

        debug!(backend = %self.name, %id, method = %method, "Sending request");

        if let Err(e) = self.write(&message).await {
            self.pending.remove(&id);
            return Err(e);
        }

        Ok(PendingResponse {
            transport: Arc::clone(self),
            id,
            method,
            rx: Some(rx),
        })
    }

    /// Write a notification or response without correlation
    pub async fn forward(&self, message: &JsonRpcMessage) -> Result<(), GatewayError> {
        trace!(backend = %self.name, ?message, "Forwarding uncorrelated message");
        self.write(message).await
    }

    async fn write(&self, message: &JsonRpcMessage) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::transport(&self.name, "connection closed"));
        }
        let line = message
            .to_line()
            .map_err(|e| GatewayError::InvalidMessage(e.to_string()))?;

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(GatewayError::transport(&self.name, "connection closed"));
        };

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            let reason = format!("failed to write: {}", e);
            self.emit(TransportEvent::Error(reason.clone()));
            GatewayError::transport(&self.name, reason)
        })
    }

    /// Close the underlying connection. Safe to call more than once.
    ///
    /// Returns within [`CLOSE_TIMEOUT`] even when a write is stuck on a peer that
    /// stopped reading; that write fails once the peer goes away.
    pub async fn close(&self) -> Result<(), GatewayError> {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.mark_closed();

        let writer = match tokio::time::timeout(CLOSE_TIMEOUT, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!(backend = %self.name, "Write in progress, closing without shutdown");
                return Ok(());
            }
        };

        let Some(mut writer) = writer else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::transport(&self.name, format!("failed to close: {}", e))),
            Err(_) => Err(GatewayError::transport(&self.name, "timed out closing")),
        }
    }

    fn handle_inbound(&self, message: JsonRpcMessage) {
        // Only responses can answer a call; a backend request may reuse one of our ids.
        if message.method.is_none() {
            if let Some(id) = message.id.as_ref() {
                if let Some((_, pending)) = self.pending.remove(id) {
                    trace!(backend = %self.name, %id, method = %pending.method, "Correlated response");
                    let _ = pending.tx.send(message);
                    return;
                }
            }
        }

        self.emit(TransportEvent::Message(message));
    }

    fn emit(&self, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock();
        // A failed send means that subscriber left
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!(backend = %self.name, ?event, "No subscribers, dropping event");
        }
    }

    fn mark_closed(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(backend = %self.name, pending = self.pending.len(), "Transport closed");
        // Dropping the senders fails every waiter with a transport error
        self.pending.clear();
        self.emit(TransportEvent::Closed);
    }
}

impl fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTransport")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish()
    }
}

async fn read_loop<R>(transport: Weak<BackendTransport>, name: String, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let next = lines.next_line().await;
        let Some(transport) = transport.upgrade() else {
            return;
        };

        match next {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                    Ok(message) => transport.handle_inbound(message),
                    Err(_) => {
                        debug!(backend = %name, "stdout: {}", trimmed);
                    }
                }
            }
            Ok(None) => {
                debug!(backend = %name, "Backend stdout closed");
                transport.mark_closed();
                return;
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "Failed to read from backend");
                transport.emit(TransportEvent::Error(format!("failed to read: {}", e)));
                transport.mark_closed();
                return;
            }
        }
    }
}

/// A request that has been written and is waiting for its response.
///
/// Dropping it without waiting forgets the call.
pub struct PendingResponse {
    transport: Arc<BackendTransport>,
    id: RequestId,
    method: String,
    rx: Option<oneshot::Receiver<JsonRpcMessage>>,
}

impl PendingResponse {
    /// The wire id assigned to this request
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response or the transport's timeout
    pub async fn wait(mut self) -> Result<JsonRpcMessage, GatewayError> {
        let Some(rx) = self.rx.take() else {
            return Err(GatewayError::transport(self.transport.name(), "response already taken"));
        };

        match tokio::time::timeout(self.transport.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::transport(
                self.transport.name(),
                "connection closed before response",
            )),
            Err(_) => {
                warn!(
                    backend = %self.transport.name(),
                    id = %self.id,
                    method = %self.method,
                    timeout_ms = self.transport.timeout.as_millis() as u64,
                    "Timeout waiting for response"
                );
                Err(GatewayError::Timeout {
                    backend: self.transport.name().to_string(),
                    method: self.method.clone(),
                    timeout: self.transport.timeout,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.transport.pending.remove(&self.id);
    }
}
