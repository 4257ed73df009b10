use crate::error::{
    full_body, json_body_response, json_error_response, ErrorCode, GatewayBody, GatewayError,
};
use crate::gateway::{Gateway, PostOutcome};
use crate::jsonrpc::JsonRpcMessage;
use futures::Stream;
use http_body_util::{BodyExt, Limited, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, CACHE_CONTROL, CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted POST body
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// HTTP front end: SSE sessions, message posting and server listing
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway).await }
    });

    debug!(addr = %addr, "Accepted connection");
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_headers = req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS).cloned();

    debug!(%method, %path, "Gateway request");

    let mut response = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => preflight_response(request_headers),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let info = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            json_body_response(StatusCode::OK, info.to_string())
        }
        (&Method::GET, "/sse") => handle_sse(req.uri(), &gateway),
        (&Method::POST, "/message") => handle_message(req, &gateway).await,
        (&Method::GET, "/servers") => handle_servers(&gateway),
        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}

fn handle_sse(uri: &Uri, gateway: &Gateway) -> Response<GatewayBody> {
    let Some(server) = query_param(uri, "server").filter(|s| !s.is_empty()) else {
        return json_error_response(ErrorCode::InvalidMessage, "Server name is required");
    };

    match gateway.open_session(&server) {
        Ok(stream) => sse_response(&stream.session_id, stream.messages),
        Err(e) => {
            error!(backend = %server, error = %e, "Failed to open session");
            e.into_response()
        }
    }
}

async fn handle_message(req: Request<Incoming>, gateway: &Gateway) -> Response<GatewayBody> {
    let session_id = query_param(req.uri(), "sessionId").filter(|s| !s.is_empty());

    let body = match Limited::new(req.into_body(), MAX_MESSAGE_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read message body");
            return GatewayError::InvalidMessage(e.to_string()).into_response();
        }
    };

    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => return GatewayError::InvalidMessage(e.to_string()).into_response(),
    };

    debug!(
        session_id = session_id.as_deref().unwrap_or("-"),
        method = message.method.as_deref().unwrap_or("-"),
        "Received message"
    );

    match gateway.post_message(session_id.as_deref(), message).await {
        Ok(PostOutcome::Accepted) => text_response(StatusCode::ACCEPTED, "Accepted"),
        Ok(PostOutcome::Answered(value)) => json_body_response(StatusCode::OK, value.to_string()),
        Err(e) => {
            warn!(error = %e, "Message handling failed");
            e.into_response()
        }
    }
}

fn handle_servers(gateway: &Gateway) -> Response<GatewayBody> {
    match gateway.load_config() {
        Ok(config) => {
            let names = serde_json::Value::from(config.backend_names());
            json_body_response(StatusCode::OK, names.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to read server list");
            e.into_response()
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn preflight_response(request_headers: Option<HeaderValue>) -> Response<GatewayBody> {
    let allow_headers = request_headers.unwrap_or_else(|| HeaderValue::from_static("Content-Type"));
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers)
        .body(full_body(Bytes::new()))
        .expect("valid response with StatusCode enum and static headers")
}

fn sse_response(session_id: &str, messages: mpsc::Receiver<JsonRpcMessage>) -> Response<GatewayBody> {
    let stream = SseStream {
        endpoint: Some(format!("/message?sessionId={}", session_id)),
        messages,
    };
    let body = StreamBody::new(stream).map_err(|never| match never {}).boxed();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("valid response with StatusCode enum and static headers")
}

/// Format one server-sent event
fn sse_event(event: &str, data: &str) -> Bytes {
    let mut out = format!("event: {}\n", event);
    for line in data.lines() {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// Event stream for one session: the endpoint event, then every message for the client
struct SseStream {
    endpoint: Option<String>,
    messages: mpsc::Receiver<JsonRpcMessage>,
}

impl Stream for SseStream {
    type Item = Result<Frame<Bytes>, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(endpoint) = self.endpoint.take() {
            return Poll::Ready(Some(Ok(Frame::data(sse_event("endpoint", &endpoint)))));
        }

        match self.messages.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                let data = serde_json::to_string(&message).unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to serialize message for client");
                    "{}".to_string()
                });
                Poll::Ready(Some(Ok(Frame::data(sse_event("message", &data)))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decoded value of the first `key` in the query string
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key {
            return None;
        }
        let v = v.replace('+', " ");
        Some(
            urlencoding::decode(&v)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(v),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_query_param() {
        let uri: Uri = "/sse?server=my%20files&other=1".parse().unwrap();
        assert_eq!(query_param(&uri, "server").as_deref(), Some("my files"));
        assert_eq!(query_param(&uri, "other").as_deref(), Some("1"));
        assert_eq!(query_param(&uri, "missing"), None);

        let bare: Uri = "/message?sessionId".parse().unwrap();
        assert_eq!(query_param(&bare, "sessionId").as_deref(), Some(""));

        let none: Uri = "/message".parse().unwrap();
        assert_eq!(query_param(&none, "sessionId"), None);
    }

    #[test]
    fn test_sse_event_format() {
        assert_eq!(
            sse_event("endpoint", "/message?sessionId=abc"),
            Bytes::from("event: endpoint\ndata: /message?sessionId=abc\n\n")
        );
        assert_eq!(
            sse_event("message", "a\nb"),
            Bytes::from("event: message\ndata: a\ndata: b\n\n")
        );
    }

    fn frame_text(frame: Frame<Bytes>) -> String {
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_sse_stream_sends_endpoint_first() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = SseStream {
            endpoint: Some("/message?sessionId=s1".to_string()),
            messages: rx,
        };

        tx.send(JsonRpcMessage::notification("ping", None)).await.unwrap();
        drop(tx);

        let first = frame_text(stream.next().await.unwrap().unwrap());
        assert_eq!(first, "event: endpoint\ndata: /message?sessionId=s1\n\n");

        let second = frame_text(stream.next().await.unwrap().unwrap());
        assert!(second.starts_with("event: message\ndata: "));
        let data = second
            .trim_start_matches("event: message\ndata: ")
            .trim_end();
        let parsed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed, json!({"jsonrpc": "2.0", "method": "ping"}));

        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_preflight_reflects_requested_headers() {
        let response = preflight_response(Some(HeaderValue::from_static("x-custom, content-type")));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "x-custom, content-type"
        );

        let default = preflight_response(None);
        assert_eq!(
            default.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type"
        );
    }
}
