//! MCP over JSON-RPC 2.0.

use futumcp_tools::{ContentBlock, Dispatcher, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "futu-mcp";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// MCP rendering of a tool result. Structured payloads travel as JSON text.
pub fn tool_result_to_mcp(result: &ToolResult) -> Value {
    let content: Vec<Value> = result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Json { json } => json!({
                "type": "text",
                "text": serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string()),
            }),
        })
        .collect();
    json!({"content": content, "isError": result.is_error})
}

/// Protocol front end shared by all transports.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    initialized: AtomicBool,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle one raw message. Returns the serialized response, or `None`
    /// for notifications.
    pub async fn handle_message(&self, raw: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await?,
            Err(e) => RpcResponse::err(
                Value::Null,
                RpcError::new(PARSE_ERROR, format!("parse error: {}", e)),
            ),
        };
        match serde_json::to_string(&response) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "Failed to serialize response");
                None
            }
        }
    }

    pub async fn handle_value(&self, value: Value) -> Option<RpcResponse> {
        let id_hint = value.get("id").cloned().unwrap_or(Value::Null);
        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(RpcResponse::err(
                    id_hint,
                    RpcError::new(INVALID_REQUEST, format!("invalid request: {}", e)),
                ))
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(RpcResponse::err(
                id_hint,
                RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }

        let Some(id) = request.id else {
            self.handle_notification(&request.method);
            return None;
        };

        debug!(method = %request.method, id = %id, "RPC request");
        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize(request.params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.dispatcher.tools()})),
            "tools/call" => self.call_tool(request.params).await,
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            )),
        };

        Some(match outcome {
            Ok(result) => RpcResponse::ok(id, result),
            Err(error) => RpcResponse::err(id, error),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => {
                self.initialized.store(true, Ordering::SeqCst);
                info!("Client initialized");
            }
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let client = params
            .and_then(|p| p.pointer("/clientInfo/name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(client, "Initialize request");
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: CallParams = params
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing params"))
            .and_then(|p| {
                serde_json::from_value(p)
                    .map_err(|e| RpcError::new(INVALID_PARAMS, format!("invalid params: {}", e)))
            })?;
        let result = self.dispatcher.dispatch(&params.name, params.arguments).await;
        Ok(tool_result_to_mcp(&result))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futumcp_gateway::{SimulatedGateway, SimulatedGatewayConfig};
    use futumcp_tools::{BrokerSessionHandle, SessionSettings};

    pub(crate) fn simulated_server() -> McpServer {
        let gateway = Arc::new(SimulatedGateway::new(SimulatedGatewayConfig::default()));
        let session = Arc::new(BrokerSessionHandle::new(gateway, SessionSettings::default()));
        McpServer::new(Arc::new(Dispatcher::new(session)))
    }

    async fn call(server: &McpServer, raw: &str) -> Value {
        let response = server.handle_message(raw).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_notification() {
        let server = simulated_server();
        let resp = call(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"clientInfo":{"name":"test"}}}"#,
        )
        .await;
        assert_eq!(resp["result"]["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(resp["result"]["serverInfo"]["name"], json!("futu-mcp"));

        let none = server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(none.is_none());
        assert!(server.is_initialized());
    }

    #[tokio::test]
    async fn test_error_codes() {
        let server = simulated_server();
        let resp = call(&server, "{not json").await;
        assert_eq!(resp["error"]["code"], json!(PARSE_ERROR));
        assert_eq!(resp["id"], Value::Null);

        let resp = call(&server, r#"{"jsonrpc":"1.0","id":2,"method":"ping"}"#).await;
        assert_eq!(resp["error"]["code"], json!(INVALID_REQUEST));

        let resp = call(&server, r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#).await;
        assert_eq!(resp["error"]["code"], json!(METHOD_NOT_FOUND));

        let resp = call(&server, r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{}}"#).await;
        assert_eq!(resp["error"]["code"], json!(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let server = simulated_server();
        let resp = call(&server, r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 10);
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == json!("object")));
        assert_eq!(resp["id"], json!("a"));
    }

    #[tokio::test]
    async fn test_tool_failure_is_successful_rpc() {
        let server = simulated_server();
        let resp = call(
            &server,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"get_positions","arguments":{}}}"#,
        )
        .await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["isError"], json!(true));
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("[TradingLockedError]"));
    }

    #[tokio::test]
    async fn test_tool_call_payload_is_text_json() {
        let server = simulated_server();
        let resp = call(
            &server,
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"get_stock_quote","arguments":{"stock_code":"00700","market":"HK"}}}"#,
        )
        .await;
        assert_eq!(resp["result"]["isError"], json!(false));
        let content = resp["result"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        let payload: Value = serde_json::from_str(content[1]["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload[0]["code"], json!("HK.00700"));
    }
}
