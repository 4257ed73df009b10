//! Mock tool server for integration testing
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout.
//!
//! Environment variables:
//! - MOCK_SERVER_NAME: Name reported in tool output (default: mock)
//! - MOCK_TOOLS: Comma-separated tool names (default: echo)
//! - MOCK_RESPONSE_DELAY_MS: Delay before every response (default: 0)
//! - MOCK_SCHEMA_KEY: Key used for tool schemas, `inputSchema` or `input_schema` (default: inputSchema)

use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Settings {
    name: String,
    tools: Vec<String>,
    delay: Duration,
    schema_key: String,
}

impl Settings {
    fn from_env() -> Self {
        let name = env::var("MOCK_SERVER_NAME").unwrap_or_else(|_| "mock".to_string());
        let tools = env::var("MOCK_TOOLS")
            .unwrap_or_else(|_| "echo".to_string())
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let delay = env::var("MOCK_RESPONSE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        let schema_key =
            env::var("MOCK_SCHEMA_KEY").unwrap_or_else(|_| "inputSchema".to_string());

        Self {
            name,
            tools,
            delay,
            schema_key,
        }
    }
}

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();
    eprintln!(
        "Mock server: {} serving tools {:?}",
        settings.name, settings.tools
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        let message: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Mock server: ignoring invalid line: {}", e);
                continue;
            }
        };

        let replies = handle(&settings, &message);
        if replies.is_empty() {
            continue;
        }
        if !settings.delay.is_zero() {
            tokio::time::sleep(settings.delay).await;
        }
        for reply in replies {
            let mut out = reply.to_string();
            out.push('\n');
            if stdout.write_all(out.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                return;
            }
        }
    }

    eprintln!("Mock server: stdin closed, exiting");
}

fn handle(settings: &Settings, message: &Value) -> Vec<Value> {
    let method = message.get("method").and_then(Value::as_str);
    let Some(id) = message.get("id").cloned() else {
        // Notifications
        return match method {
            Some("notifications/initialized") => vec![json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": format!("{} initialized", settings.name)},
            })],
            _ => Vec::new(),
        };
    };

    let Some(method) = method else {
        // A response to something we never asked
        return Vec::new();
    };

    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": settings.name, "version": "0.1.0"},
        }),
        "ping" => json!({}),
        "tools/list" => {
            let tools: Vec<Value> = settings
                .tools
                .iter()
                .map(|tool| {
                    let mut entry = json!({
                        "name": tool,
                        "description": format!("{} from {}", tool, settings.name),
                    });
                    entry[settings.schema_key.as_str()] =
                        json!({"type": "object", "properties": {"text": {"type": "string"}}});
                    entry
                })
                .collect();
            json!({ "tools": tools })
        }
        "tools/call" => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
            if tool == "fail" {
                return vec![error(id, -32000, "tool failed on purpose")];
            }
            if !settings.tools.iter().any(|t| t == tool) {
                return vec![error(id, -32602, &format!("Unknown tool: {}", tool))];
            }
            let text = params
                .get("arguments")
                .and_then(|a| a.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({
                "content": [{"type": "text", "text": format!("{}:{}:{}", settings.name, tool, text)}],
            })
        }
        other => return vec![error(id, -32601, &format!("Method not found: {}", other))],
    };

    vec![json!({"jsonrpc": "2.0", "id": id, "result": result})]
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}
