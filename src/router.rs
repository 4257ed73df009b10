//! Tool aggregation for requests that arrive without a session
//!
//! `tools/list` fans out to every live backend and merges the answers; `tools/call`
//! finds the backend that owns the tool and forwards the call there.

use crate::error::GatewayError;
use crate::jsonrpc::{JsonRpcError, JsonRpcMessage, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};
use crate::transport::BackendTransport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Id placed on the aggregation `tools/list` envelope.
///
/// The transport assigns the real wire id; a session proxy drops any tool list
/// response that still carries this id.
pub const AGGREGATION_QUERY_ID: i64 = 0;

/// JSON-RPC internal error code used when a backend answers with neither result nor error
const INTERNAL_ERROR_CODE: i64 = -32603;

/// Where the router finds backends to query
pub trait BackendSource: Send + Sync {
    /// Name and transport of every backend that can currently take calls
    fn live_backends(&self) -> Vec<(String, Arc<BackendTransport>)>;
}

/// One tool as exposed by the gateway
#[derive(Debug, Clone, Serialize)]
pub struct ToolRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Backend that owns the tool
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip)]
    transport: Arc<BackendTransport>,
}

impl ToolRecord {
    pub fn transport(&self) -> &Arc<BackendTransport> {
        &self.transport
    }
}

/// Tool entry as backends report it. Either schema spelling is accepted.
#[derive(Debug, Deserialize)]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema_camel: Option<Value>,
    #[serde(default, rename = "input_schema")]
    input_schema_snake: Option<Value>,
}

impl ListedTool {
    fn into_record(self, server: &str, transport: &Arc<BackendTransport>) -> ToolRecord {
        ToolRecord {
            name: self.name,
            description: self.description,
            server: server.to_string(),
            input_schema: self.input_schema_camel.or(self.input_schema_snake),
            transport: Arc::clone(transport),
        }
    }
}

#[derive(Clone)]
pub struct AggregationRouter {
    backends: Arc<dyn BackendSource>,
}

impl AggregationRouter {
    pub fn new(backends: Arc<dyn BackendSource>) -> Self {
        Self { backends }
    }

    /// Answer a session-less message.
    ///
    /// Only `tools/list` and `tools/call` are handled; anything else has no session
    /// to go to and fails with [`GatewayError::SessionNotFound`].
    pub async fn handle(&self, message: &JsonRpcMessage) -> Result<Value, GatewayError> {
        match message.method.as_deref() {
            Some(METHOD_TOOLS_LIST) => {
                let tools = self.list_tools().await;
                Ok(json!({ "tools": tools }))
            }
            Some(METHOD_TOOLS_CALL) => {
                let params = message.params.as_ref();
                let name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::InvalidMessage("tools/call requires params.name".to_string())
                    })?;
                let arguments = params.and_then(|p| p.get("arguments")).cloned();
                self.call_tool(name, arguments).await
            }
            _ => Err(GatewayError::SessionNotFound),
        }
    }

    /// Collect tools from every live backend concurrently.
    ///
    /// A backend that fails or times out contributes nothing.
    pub async fn list_tools(&self) -> Vec<ToolRecord> {
        let backends = self.backends.live_backends();
        info!(count = backends.len(), "Collecting tools from running servers");

        let results = futures::future::join_all(
            backends
                .iter()
                .map(|(name, transport)| query_backend(name, transport)),
        )
        .await;

        let mut tools = Vec::new();
        for ((name, _), result) in backends.iter().zip(results) {
            match result {
                Ok(mut records) => {
                    debug!(backend = %name, count = records.len(), "Collected tools");
                    tools.append(&mut records);
                }
                Err(e) => warn!(backend = %name, error = %e, "Error getting tools"),
            }
        }
        tools
    }

    /// Call `name` on the backend that lists it.
    ///
    /// When several backends expose the same name the first one listed wins.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, GatewayError> {
        let tools = self.list_tools().await;
        let Some(tool) = tools.into_iter().find(|t| t.name == name) else {
            return Err(GatewayError::ToolNotFound(name.to_string()));
        };

        info!(tool = name, backend = %tool.server, "Calling tool");

        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(arguments) = arguments {
            params.insert("arguments".to_string(), arguments);
        }

        let response = tool
            .transport
            .request(METHOD_TOOLS_CALL, Value::Object(params))
            .await?;

        match (response.result, response.error) {
            (_, Some(error)) => Err(GatewayError::Rpc(error)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(GatewayError::Rpc(JsonRpcError {
                code: INTERNAL_ERROR_CODE,
                message: "Unknown error occurred".to_string(),
                data: None,
            })),
        }
    }
}

async fn query_backend(
    name: &str,
    transport: &Arc<BackendTransport>,
) -> Result<Vec<ToolRecord>, GatewayError> {
    let query = JsonRpcMessage::request(AGGREGATION_QUERY_ID, METHOD_TOOLS_LIST, json!({}));
    let response = transport.send(query).await?;

    if let Some(error) = response.error {
        return Err(GatewayError::Rpc(error));
    }

    let Some(Value::Array(listed)) = response.result.and_then(|mut r| r.get_mut("tools").map(Value::take))
    else {
        return Ok(Vec::new());
    };

    Ok(listed
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<ListedTool>(value) {
            Ok(tool) => Some(tool.into_record(name, transport)),
            Err(e) => {
                warn!(backend = name, error = %e, "Skipping malformed tool entry");
                None
            }
        })
        .collect())
}
