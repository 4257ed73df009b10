//! Per-session splice between a downstream client and a backend transport

use crate::jsonrpc::{JsonRpcError, JsonRpcMessage, RequestId, METHOD_TOOLS_LIST};
use crate::router::AGGREGATION_QUERY_ID;
use crate::session::ClientStream;
use crate::transport::{BackendTransport, TransportEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// JSON-RPC code relayed to the client when a forwarded request fails in the gateway
const GATEWAY_ERROR_CODE: i64 = -32603;

/// Which side ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Backend,
}

/// Relay messages between `client` and `backend` until one side closes.
///
/// Several sessions may share one backend; each receives every uncorrelated backend
/// message. When the client goes first the backend transport is closed; when the
/// backend goes first the client's outbound stream is dropped.
pub async fn splice(client: ClientStream, backend: Arc<BackendTransport>) -> ClosedBy {
    let ClientStream {
        session_id,
        mut inbound,
        outbound,
    } = client;
    let mut events = backend.subscribe();
    let mut responders: Vec<JoinHandle<()>> = Vec::new();

    info!(session_id, backend = %backend.name(), "Proxy started");

    let closed_by = loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Some(responder) = forward_to_backend(&session_id, &backend, &outbound, message).await {
                        responders.retain(|task| !task.is_finished());
                        responders.push(responder);
                    }
                }
                None => break ClosedBy::Client,
            },
            event = events.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    if !forward_to_client(&session_id, &outbound, message).await {
                        break ClosedBy::Client;
                    }
                }
                Some(TransportEvent::Error(reason)) => {
                    error!(session_id, backend = %backend.name(), error = %reason, "Backend transport error");
                }
                Some(TransportEvent::Closed) | None => break ClosedBy::Backend,
            },
            _ = outbound.closed() => break ClosedBy::Client,
        }
    };

    for responder in responders {
        responder.abort();
    }

    match closed_by {
        ClosedBy::Client => {
            info!(session_id, backend = %backend.name(), "Client closed, closing backend transport");
            if let Err(e) = backend.close().await {
                error!(session_id, error = %e, "Error closing backend transport");
            }
        }
        ClosedBy::Backend => {
            info!(session_id, backend = %backend.name(), "Backend closed, closing client stream");
            drop(outbound);
        }
    }

    closed_by
}

/// Forward one client message. Returns the task awaiting the response for requests.
async fn forward_to_backend(
    session_id: &str,
    backend: &Arc<BackendTransport>,
    outbound: &mpsc::Sender<JsonRpcMessage>,
    message: JsonRpcMessage,
) -> Option<JoinHandle<()>> {
    // Tool listing is answered by the gateway across all backends
    if message.method_is(METHOD_TOOLS_LIST) {
        debug!(session_id, "Dropping client tools/list");
        return None;
    }

    if !message.is_request() {
        if let Err(e) = backend.forward(&message).await {
            error!(session_id, error = %e, "Error forwarding message to backend");
        }
        return None;
    }

    let client_id = message.id.clone()?;
    let pending = match backend.dispatch(message).await {
        Ok(pending) => pending,
        Err(e) => {
            error!(session_id, id = %client_id, error = %e, "Error sending request to backend");
            let _ = outbound.send(gateway_error(client_id, &e)).await;
            return None;
        }
    };

    let outbound = outbound.clone();
    let session_id = session_id.to_string();
    Some(tokio::spawn(async move {
        let response = match pending.wait().await {
            Ok(mut response) => {
                response.id = Some(client_id);
                response
            }
            Err(e) => {
                warn!(session_id, id = %client_id, error = %e, "Backend request failed");
                gateway_error(client_id, &e)
            }
        };
        if outbound.send(response).await.is_err() {
            debug!(session_id, "Client gone before response arrived");
        }
    }))
}

/// Forward one backend message. Returns false once the client is gone.
async fn forward_to_client(
    session_id: &str,
    outbound: &mpsc::Sender<JsonRpcMessage>,
    message: JsonRpcMessage,
) -> bool {
    let is_aggregation_reply =
        message.id == Some(RequestId::Number(AGGREGATION_QUERY_ID)) && message.has_tool_list();
    if is_aggregation_reply {
        debug!(session_id, "Dropping aggregation tools/list response");
        return true;
    }

    outbound.send(message).await.is_ok()
}

fn gateway_error(id: RequestId, err: &crate::error::GatewayError) -> JsonRpcMessage {
    JsonRpcMessage::error_response(
        id,
        JsonRpcError {
            code: GATEWAY_ERROR_CODE,
            message: err.to_string(),
            data: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::testing::{manual_backend, FakeBackend};
    use serde_json::json;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(300);

    struct Harness {
        store: Arc<SessionStore>,
        session_id: String,
        to_client: mpsc::Receiver<JsonRpcMessage>,
        backend: FakeBackend,
        transport: Arc<BackendTransport>,
        proxy: JoinHandle<ClosedBy>,
    }

    fn start() -> Harness {
        let store = SessionStore::new();
        let (transport, backend) = manual_backend("files", SHORT);
        let (client, to_client) = store.open("files");
        let session_id = client.session_id.clone();
        let proxy = tokio::spawn(splice(client, Arc::clone(&transport)));
        Harness {
            store,
            session_id,
            to_client,
            backend,
            transport,
            proxy,
        }
    }

    impl Harness {
        fn post(&self, message: JsonRpcMessage) {
            self.store.deliver(&self.session_id, message).unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_response_restores_client_id() {
        let mut h = start();

        h.post(JsonRpcMessage::request(
            RequestId::String("client-7".to_string()),
            "resources/read",
            json!({"uri": "file:///a"}),
        ));

        let wire = h.backend.recv().await.unwrap();
        assert_eq!(wire.method.as_deref(), Some("resources/read"));
        assert_ne!(wire.id, Some(RequestId::String("client-7".to_string())));

        h.backend
            .send(JsonRpcMessage::response(wire.id.unwrap(), json!({"contents": []})))
            .await;

        let delivered = h.to_client.recv().await.unwrap();
        assert_eq!(delivered.id, Some(RequestId::String("client-7".to_string())));
        assert_eq!(delivered.result, Some(json!({"contents": []})));
    }

    #[tokio::test]
    async fn test_client_tools_list_is_dropped() {
        let mut h = start();

        h.post(JsonRpcMessage::request(1, METHOD_TOOLS_LIST, json!({})));
        h.post(JsonRpcMessage::notification("notifications/initialized", None));

        // Only the notification reaches the backend
        let wire = h.backend.recv().await.unwrap();
        assert!(wire.method_is("notifications/initialized"));
        assert!(wire.id.is_none());
    }

    #[tokio::test]
    async fn test_backend_messages_pass_through() {
        let mut h = start();

        let progress = JsonRpcMessage::notification("notifications/progress", Some(json!({"p": 50})));
        h.backend.send(progress.clone()).await;

        assert_eq!(h.to_client.recv().await, Some(progress));
    }

    #[tokio::test]
    async fn test_aggregation_reply_is_swallowed() {
        let mut h = start();

        h.backend
            .send(JsonRpcMessage::response(
                RequestId::Number(AGGREGATION_QUERY_ID),
                json!({"tools": [{"name": "read"}]}),
            ))
            .await;
        // Same id without a tool list is passed on
        let other = JsonRpcMessage::response(RequestId::Number(AGGREGATION_QUERY_ID), json!({"ok": true}));
        h.backend.send(other.clone()).await;

        assert_eq!(h.to_client.recv().await, Some(other));
    }

    #[tokio::test]
    async fn test_backend_timeout_relayed_as_error() {
        let mut h = start();

        h.post(JsonRpcMessage::request(5, "slow/op", json!({})));
        let _ = h.backend.recv().await.unwrap();

        let delivered = h.to_client.recv().await.unwrap();
        assert_eq!(delivered.id, Some(RequestId::Number(5)));
        assert_eq!(delivered.error.unwrap().code, GATEWAY_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_client_close_closes_backend_once() {
        let mut h = start();
        let mut observer = h.transport.subscribe();

        drop(h.to_client);

        assert_eq!(h.proxy.await.unwrap(), ClosedBy::Client);
        assert!(h.transport.is_closed());
        assert_eq!(observer.recv().await, Some(TransportEvent::Closed));
        assert!(observer.try_recv().is_err());
        // Closing stdin reaches the backend as a single EOF with nothing after it
        assert_eq!(h.backend.recv().await, None);
        assert_eq!(h.backend.recv().await, None);
    }

    #[tokio::test]
    async fn test_backend_close_closes_client_once() {
        let mut h = start();
        let mut observer = h.transport.subscribe();

        drop(h.backend);

        assert_eq!(h.proxy.await.unwrap(), ClosedBy::Backend);
        assert_eq!(h.to_client.recv().await, None);
        assert_eq!(observer.recv().await, Some(TransportEvent::Closed));
        assert!(observer.try_recv().is_err());
        // The session stays registered until the gateway removes it
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_sharing_a_backend_both_receive() {
        let mut h = start();
        let (other, mut other_rx) = h.store.open("files");
        let other_proxy = tokio::spawn(splice(other, Arc::clone(&h.transport)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let note = JsonRpcMessage::notification("notifications/resources/updated", None);
        h.backend.send(note.clone()).await;

        assert_eq!(h.to_client.recv().await, Some(note.clone()));
        assert_eq!(other_rx.recv().await, Some(note));
        assert!(!h.proxy.is_finished());
        assert!(!other_proxy.is_finished());
        assert_eq!(h.transport.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_forward_error_does_not_close_session() {
        let mut h = start();

        // A response from the client to a backend request is forwarded as-is
        let reply = JsonRpcMessage::response(RequestId::Number(900), json!({"approved": true}));
        h.post(reply.clone());
        assert_eq!(h.backend.recv().await, Some(reply));

        let note = JsonRpcMessage::notification("still/alive", None);
        h.backend.send(note.clone()).await;
        assert_eq!(h.to_client.recv().await, Some(note));
        assert!(!h.proxy.is_finished());
    }
}
