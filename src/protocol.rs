//! Wire shapes for the JSON-RPC stdio protocol
//!
//! Tool servers speak JSON-RPC 2.0 over newline-delimited frames on
//! stdin/stdout. This module defines the frame types plus the typed results
//! for the two operations the core depends on: `tools/list` and `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string sent on every frame
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision advertised during the initialize handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names used by the core
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
    pub const PING: &str = "ping";
}

/// Outgoing request or notification frame
///
/// Requests carry an id; notifications do not and get no response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request frame expecting a response correlated by `id`
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a one-way notification frame
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Incoming frame from the server
///
/// A response carries `id` plus `result` or `error`; server-initiated
/// notifications carry `method` and no id. The transport skips anything it
/// did not ask for.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcFrame {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub method: Option<String>,
}

/// Application-level error object from a JSON-RPC response
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// One tool as reported by a server's `tools/list` response
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
    /// Set by the manager from the server definition's tool lists; a disabled
    /// tool is still reported by discovery but excluded from the catalog.
    #[serde(skip)]
    pub disabled: bool,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Result shape of `tools/list`
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
}

/// One content block of a `tools/call` result
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
}

/// Result shape of `tools/call`
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}
