//! In-memory backends for unit tests

use crate::jsonrpc::{JsonRpcMessage, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};
use crate::router::BackendSource;
use crate::transport::BackendTransport;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};

/// Everything a scripted backend has received, in order
pub type ReceivedLog = Arc<Mutex<Vec<JsonRpcMessage>>>;

/// The far end of an in-memory backend connection, driven by the test
pub struct FakeBackend {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeBackend {
    /// Next message written by the transport, or None once it closed
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        while let Ok(Some(line)) = self.lines.next_line().await {
            if let Ok(message) = serde_json::from_str(&line) {
                return Some(message);
            }
        }
        None
    }

    pub async fn send(&mut self, message: JsonRpcMessage) {
        let line = message.to_line().unwrap();
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

pub fn manual_backend(name: &str, timeout: Duration) -> (Arc<BackendTransport>, FakeBackend) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(ours);
    let transport = BackendTransport::open(name, read, write, timeout);

    let (read, writer) = tokio::io::split(theirs);
    let backend = FakeBackend {
        lines: BufReader::new(read).lines(),
        writer,
    };
    (transport, backend)
}

/// A backend that answers each message with whatever `respond` returns
pub fn scripted_backend<F>(
    name: &str,
    timeout: Duration,
    respond: F,
) -> (Arc<BackendTransport>, ReceivedLog)
where
    F: Fn(&JsonRpcMessage) -> Option<JsonRpcMessage> + Send + Sync + 'static,
{
    let (transport, mut backend) = manual_backend(name, timeout);
    let log: ReceivedLog = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::clone(&log);

    tokio::spawn(async move {
        while let Some(message) = backend.recv().await {
            received.lock().push(message.clone());
            if let Some(reply) = respond(&message) {
                backend.send(reply).await;
            }
        }
    });

    (transport, log)
}

/// Responder for a tool server exposing `tools`.
///
/// `tools/call` answers with a text block naming the tool and the server.
pub fn tool_server(
    server: &str,
    tools: &[&str],
) -> impl Fn(&JsonRpcMessage) -> Option<JsonRpcMessage> + Send + Sync + 'static {
    let server = server.to_string();
    let tools: Vec<String> = tools.iter().map(|t| t.to_string()).collect();

    move |message| {
        let id = message.id.clone()?;
        if message.method_is(METHOD_TOOLS_LIST) {
            let listed: Vec<_> = tools
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{} on {}", name, server),
                        "inputSchema": {"type": "object"},
                    })
                })
                .collect();
            return Some(JsonRpcMessage::response(id, json!({ "tools": listed })));
        }
        if message.method_is(METHOD_TOOLS_CALL) {
            let params = message.params.clone().unwrap_or_default();
            let tool = params["name"].as_str().unwrap_or_default().to_string();
            return Some(JsonRpcMessage::response(
                id,
                json!({
                    "content": [{"type": "text", "text": format!("{} via {}", tool, server)}],
                    "arguments": params.get("arguments").cloned(),
                }),
            ));
        }
        None
    }
}

/// Count of received messages with the given method
pub fn count_method(log: &ReceivedLog, method: &str) -> usize {
    log.lock().iter().filter(|m| m.method_is(method)).count()
}

impl BackendSource for Vec<(String, Arc<BackendTransport>)> {
    fn live_backends(&self) -> Vec<(String, Arc<BackendTransport>)> {
        self.iter()
            .filter(|(_, transport)| !transport.is_closed())
            .cloned()
            .collect()
    }
}
