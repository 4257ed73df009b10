//! JSON-RPC 2.0 envelope shared by backends and downstream clients
//!
//! Messages are kept as one loose envelope type rather than separate request/response
//! structs because the proxy has to forward whatever either side sends without losing fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol version tag carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name for listing a backend's tools
pub const METHOD_TOOLS_LIST: &str = "tools/list";

/// Method name for invoking a tool
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Request identifier: JSON-RPC allows either an integer or a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single JSON-RPC message: request, notification or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl JsonRpcMessage {
    /// Build a request carrying an id
    pub fn request(id: impl Into<RequestId>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id.into()),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id, no response expected)
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a successful response
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn error_response(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// A request has both a method and an id
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn method_is(&self, method: &str) -> bool {
        self.method.as_deref() == Some(method)
    }

    /// True when the result object carries a `tools` field
    pub fn has_tool_list(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .is_some()
    }

    /// Serialize as one newline-terminated line for stdio framing
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let msg = JsonRpcMessage::request(7, "tools/list", json!({}));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list", "params": {}})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = JsonRpcMessage::notification("notifications/initialized", None);
        let line = msg.to_line().unwrap();

        assert!(line.ends_with('\n'));
        assert!(!line.contains("\"id\""));
        assert!(!msg.is_request());
    }

    #[test]
    fn test_string_and_numeric_ids() {
        let numeric: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        let string: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();

        assert_eq!(numeric.id, Some(RequestId::Number(3)));
        assert_eq!(string.id, Some(RequestId::String("abc".to_string())));
    }

    #[test]
    fn test_error_response_shape() {
        let msg = JsonRpcMessage::error_response(
            RequestId::Number(1),
            JsonRpcError {
                code: -32601,
                message: "Method not found".to_string(),
                data: None,
            },
        );
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["error"]["code"], -32601);
        assert!(value["error"].get("data").is_none());
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_has_tool_list() {
        let with_tools = JsonRpcMessage::response(RequestId::Number(0), json!({"tools": []}));
        let without = JsonRpcMessage::response(RequestId::Number(0), json!({"content": []}));

        assert!(with_tools.has_tool_list());
        assert!(!without.has_tool_list());
    }

    #[test]
    fn test_missing_version_defaults() {
        let msg: JsonRpcMessage = serde_json::from_str(r#"{"method":"ping","id":1}"#).unwrap();
        assert_eq!(msg.jsonrpc, "2.0");
        assert!(msg.is_request());
    }
}
