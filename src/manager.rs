//! Connection manager for tool servers
//!
//! The [`ConnectionManager`] owns every [`ServerConnection`] keyed by server
//! name, drives bulk (re)connection from a [`Configuration`], and routes
//! discovery and tool calls to the right server.
//!
//! Error policy is intentionally asymmetric: discovery via
//! [`ConnectionManager::get_server_tools`] is best-effort and reports
//! failures as an empty tool list, while
//! [`ConnectionManager::call_tool`] surfaces every failure to the caller.
//! [`ConnectionManager::load_config`] is fail-fast: the first connect error
//! propagates and already-connected servers stay live.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Configuration, ServerDefinition};
use crate::connection::{ConnectionHandle, ConnectionStatus, ServerConnection};
use crate::protocol::{CallToolResult, ToolInfo};
use crate::response;
use crate::transport::{Transport, TransportError, DEFAULT_REQUEST_TIMEOUT};

/// Failures surfaced by manager operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Tool servers are not initialized; call initialize_servers or load_config first")]
    NotInitialized,

    #[error("Unknown tool server: {server}")]
    ServerNotFound { server: String },

    #[error("Tool server {server} is not connected (status: {status})")]
    ServerNotConnected {
        server: String,
        status: ConnectionStatus,
    },

    #[error("Tool {tool} on server {server} returned an error")]
    ToolReturnedError { server: String, tool: String },

    #[error("Tool {tool} on server {server} returned no content")]
    EmptyContent { server: String, tool: String },

    #[error("Tool {tool} on server {server} returned unparsable content")]
    UnparsableContent {
        server: String,
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Transport failure on server {server}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A successful tool invocation
#[derive(Debug, Clone)]
pub struct CallResult {
    /// Structured value decoded from the tool's textual payload
    pub data: Value,
    /// The unparsed protocol response
    pub raw: Value,
}

/// Discovery snapshot for one server
#[derive(Debug, Clone)]
pub struct ServerTools {
    pub server_name: String,
    pub tools: Vec<ToolInfo>,
}

#[derive(Default)]
struct ManagerState {
    connections: HashMap<String, ServerConnection>,
    initialized: bool,
}

/// Owns the set of tool-server connections for one agent session
///
/// Construct one per session and thread it through; there is no ambient
/// singleton. All mutating operations share one async lock, so a config
/// reload cannot interleave with another reload or connect.
pub struct ConnectionManager {
    state: Mutex<ManagerState>,
    request_timeout: Duration,
    config_path: Option<PathBuf>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            config_path: None,
        }
    }

    /// Override the per-request deadline applied to spawned transports
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the config file used by [`ConnectionManager::initialize_servers`]
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Connect a server, tearing down any existing connection for the name
    ///
    /// At most one live connection exists per name: an existing entry is
    /// disconnected before the new subprocess is spawned. On handshake
    /// failure the entry remains tracked as `Disconnected` and the error is
    /// re-raised. An explicit connect marks the manager initialized, the
    /// same as [`ConnectionManager::load_config`].
    pub async fn connect(&self, name: &str, definition: &ServerDefinition) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state, name, definition).await
    }

    /// Attach a server over a pre-built transport (tests, custom links)
    ///
    /// Runs the same handshake and teardown-then-connect sequence as
    /// [`ConnectionManager::connect`], and marks the manager initialized.
    pub async fn attach(
        &self,
        name: &str,
        definition: &ServerDefinition,
        transport: Arc<dyn Transport>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.initialized = true;

        Self::teardown_locked(&mut state, name).await;
        let mut conn = ServerConnection::from_transport(name, definition.clone(), transport);
        let result = conn.establish(self.request_timeout).await;
        state.connections.insert(name.to_string(), conn);
        result.map_err(|source| ClientError::Transport {
            server: name.to_string(),
            source,
        })
    }

    async fn connect_locked(
        &self,
        state: &mut ManagerState,
        name: &str,
        definition: &ServerDefinition,
    ) -> Result<(), ClientError> {
        debug!(server = %name, command = %definition.command, "ConnectionManager::connect: called");
        state.initialized = true;

        Self::teardown_locked(state, name).await;

        let mut conn = ServerConnection::new(name, definition.clone());
        let result = conn.establish(self.request_timeout).await;
        state.connections.insert(name.to_string(), conn);
        result.map_err(|source| ClientError::Transport {
            server: name.to_string(),
            source,
        })
    }

    /// Disconnect and remove a server; a no-op for unknown names
    ///
    /// Close-time errors are logged, never thrown: teardown always succeeds
    /// from the caller's perspective.
    pub async fn disconnect(&self, name: &str) {
        let mut state = self.state.lock().await;
        Self::teardown_locked(&mut state, name).await;
    }

    async fn teardown_locked(state: &mut ManagerState, name: &str) {
        if let Some(mut conn) = state.connections.remove(name) {
            if let Err(e) = conn.shutdown().await {
                warn!(server = %name, error = %e, "ConnectionManager: error closing connection");
            }
        }
    }

    /// Replace the entire connection set from a configuration
    ///
    /// Disconnects every tracked connection, then connects each configured
    /// server sequentially. Fail-fast: the first connect error propagates,
    /// leaving already-connected servers live.
    pub async fn load_config(&self, config: &Configuration) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        self.load_config_locked(&mut state, config).await
    }

    async fn load_config_locked(&self, state: &mut ManagerState, config: &Configuration) -> Result<(), ClientError> {
        info!(servers = config.servers.len(), "ConnectionManager::load_config: called");
        state.initialized = true;

        let tracked: Vec<String> = state.connections.keys().cloned().collect();
        for name in tracked {
            Self::teardown_locked(state, &name).await;
        }

        for (name, definition) in &config.servers {
            self.connect_locked(state, name, definition).await?;
        }
        Ok(())
    }

    /// Load the default configuration source and connect its servers
    ///
    /// Idempotent: if the manager is already initialized this returns
    /// immediately. A missing config file is created with an empty server
    /// set.
    pub async fn initialize_servers(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if state.initialized {
            debug!("ConnectionManager::initialize_servers: already initialized");
            return Ok(());
        }

        let path = self.config_path.clone().unwrap_or_else(Configuration::default_path);
        let config = Configuration::load_or_default(&path)?;
        self.load_config_locked(&mut state, &config).await
    }

    /// Names of servers currently `Connected` (point-in-time snapshot)
    pub async fn get_available_servers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.status() == ConnectionStatus::Connected)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Status of a tracked server, if any
    pub async fn server_status(&self, name: &str) -> Option<ConnectionStatus> {
        let state = self.state.lock().await;
        state.connections.get(name).map(|conn| conn.status())
    }

    /// Diagnostic error state of a tracked server, if any
    pub async fn server_last_error(&self, name: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state.connections.get_mut(name).and_then(|conn| conn.last_error())
    }

    /// Discover a server's tools, best-effort
    ///
    /// An absent or non-connected server yields an empty list; a discovery
    /// failure is logged and also yields an empty list. Missing tools are
    /// recoverable by asking again, so discovery never throws.
    pub async fn get_server_tools(&self, name: &str) -> ServerTools {
        let handle = {
            let state = self.state.lock().await;
            state.connections.get(name).and_then(|conn| conn.handle())
        };

        let Some(handle) = handle else {
            debug!(server = %name, "ConnectionManager::get_server_tools: server not connected");
            return ServerTools {
                server_name: name.to_string(),
                tools: Vec::new(),
            };
        };

        match handle.list_tools().await {
            Ok(tools) => ServerTools {
                server_name: name.to_string(),
                tools,
            },
            Err(e) => {
                warn!(server = %name, error = %e, "ConnectionManager::get_server_tools: discovery failed");
                self.fail_on_timeout(name, &e).await;
                ServerTools {
                    server_name: name.to_string(),
                    tools: Vec::new(),
                }
            }
        }
    }

    /// Invoke a tool on a named server
    ///
    /// Unlike discovery, every failure is surfaced: uninitialized manager,
    /// unknown server, non-connected server, transport failure, or a
    /// response without usable content.
    pub async fn call_tool(&self, server_name: &str, tool_name: &str, arguments: Value) -> Result<CallResult, ClientError> {
        debug!(server = %server_name, tool = %tool_name, "ConnectionManager::call_tool: called");

        let handle = self.connected_handle(server_name).await?;
        let raw = match handle.call_tool(tool_name, arguments).await {
            Ok(raw) => raw,
            Err(source) => {
                self.fail_on_timeout(server_name, &source).await;
                return Err(ClientError::Transport {
                    server: server_name.to_string(),
                    source,
                });
            }
        };

        let result: CallToolResult =
            serde_json::from_value(raw.clone()).map_err(|source| ClientError::UnparsableContent {
                server: server_name.to_string(),
                tool: tool_name.to_string(),
                source,
            })?;

        response::parse_call_result(server_name, tool_name, &result, raw)
    }

    /// Probe a named server's liveness
    pub async fn ping(&self, server_name: &str) -> Result<Value, ClientError> {
        let handle = self.connected_handle(server_name).await?;
        match handle.ping().await {
            Ok(value) => Ok(value),
            Err(source) => {
                self.fail_on_timeout(server_name, &source).await;
                Err(ClientError::Transport {
                    server: server_name.to_string(),
                    source,
                })
            }
        }
    }

    /// A timed-out request cancelled a read mid-frame, so the link is
    /// unusable; drop the connection to `Disconnected` with the timeout
    /// recorded as its last error.
    async fn fail_on_timeout(&self, name: &str, error: &TransportError) {
        if !matches!(error, TransportError::Timeout(_)) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connections.get_mut(name) {
            warn!(server = %name, "ConnectionManager: request timed out, disconnecting server");
            conn.abort(error.to_string()).await;
        }
    }

    async fn connected_handle(&self, server_name: &str) -> Result<ConnectionHandle, ClientError> {
        let state = self.state.lock().await;
        if !state.initialized {
            return Err(ClientError::NotInitialized);
        }
        let conn = state
            .connections
            .get(server_name)
            .ok_or_else(|| ClientError::ServerNotFound {
                server: server_name.to_string(),
            })?;
        conn.handle().ok_or_else(|| ClientError::ServerNotConnected {
            server: server_name.to_string(),
            status: conn.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods;
    use crate::transport::mock::MockTransport;

    fn definition(command: &str) -> ServerDefinition {
        ServerDefinition {
            command: command.to_string(),
            args: vec![],
            env: Default::default(),
            enabled_tools: None,
            disabled_tools: None,
        }
    }

    fn text_result(text: &str) -> Value {
        serde_json::json!({
            "content": [{"type": "text", "text": text}],
            "isError": false,
        })
    }

    #[tokio::test]
    async fn test_call_tool_before_initialization_fails() {
        let manager = ConnectionManager::new();

        let err = manager.call_tool("any", "tool", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
    }

    #[tokio::test]
    async fn test_call_tool_unknown_server_fails_without_spawning() {
        let manager = ConnectionManager::new();
        manager.load_config(&Configuration::default()).await.unwrap();

        let err = manager.call_tool("nope", "tool", serde_json::json!({})).await.unwrap_err();
        match err {
            ClientError::ServerNotFound { server } => assert_eq!(server, "nope"),
            other => panic!("Expected ServerNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_tool_on_disconnected_server_reports_status() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_failure(methods::INITIALIZE));

        // Handshake fails; entry stays tracked as disconnected
        let err = manager.attach("echo", &definition("echo-server"), transport).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));

        let err = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap_err();
        match err {
            ClientError::ServerNotConnected { server, status } => {
                assert_eq!(server, "echo");
                assert_eq!(status, ConnectionStatus::Disconnected);
            }
            other => panic!("Expected ServerNotConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let manager = ConnectionManager::new();
        let transport =
            Arc::new(MockTransport::new().with_result(methods::CALL_TOOL, text_result(r#"{"a":1}"#)));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let result = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result.data, serde_json::json!({"a": 1}));
        assert_eq!(result.raw["isError"], false);
    }

    #[tokio::test]
    async fn test_call_tool_error_flag_maps_to_tool_returned_error() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_result(
            methods::CALL_TOOL,
            serde_json::json!({"content": [{"type": "text", "text": "boom"}], "isError": true}),
        ));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let err = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::ToolReturnedError { .. }));
    }

    #[tokio::test]
    async fn test_call_tool_transport_failure_propagates() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_failure(methods::CALL_TOOL));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let err = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_call_tool_timeout_disconnects_server() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_timeout(methods::CALL_TOOL));
        manager.attach("slow", &definition("slow-server"), transport).await.unwrap();

        let err = manager.call_tool("slow", "ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport {
                source: TransportError::Timeout(_),
                ..
            }
        ));

        // The link is unusable after a timeout, so the server is dropped
        assert_eq!(manager.server_status("slow").await, Some(ConnectionStatus::Disconnected));
        let last_error = manager.server_last_error("slow").await.unwrap();
        assert!(last_error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_call_tool_non_timeout_failure_keeps_server_connected() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_failure(methods::CALL_TOOL));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let err = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));

        assert_eq!(manager.server_status("echo").await, Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_connect_marks_manager_initialized() {
        let manager = ConnectionManager::new();
        // Spawn failure still counts as an explicit initialization
        let _ = manager.connect("bad", &definition("definitely-not-a-real-binary-xyz")).await;

        let err = manager.call_tool("other", "tool", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_available_servers_excludes_disconnected() {
        let manager = ConnectionManager::new();
        manager.attach("up", &definition("up-server"), Arc::new(MockTransport::new())).await.unwrap();
        let _ = manager
            .attach(
                "down",
                &definition("down-server"),
                Arc::new(MockTransport::new().with_failure(methods::INITIALIZE)),
            )
            .await;

        assert_eq!(manager.get_available_servers().await, vec!["up".to_string()]);
    }

    #[tokio::test]
    async fn test_get_server_tools_unknown_server_returns_empty() {
        let manager = ConnectionManager::new();

        let tools = manager.get_server_tools("nope").await;
        assert_eq!(tools.server_name, "nope");
        assert!(tools.tools.is_empty());
    }

    #[tokio::test]
    async fn test_get_server_tools_discovery_failure_returns_empty() {
        let manager = ConnectionManager::new();
        let transport = Arc::new(MockTransport::new().with_failure(methods::LIST_TOOLS));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let tools = manager.get_server_tools("echo").await;
        assert_eq!(tools.server_name, "echo");
        assert!(tools.tools.is_empty());
    }

    #[tokio::test]
    async fn test_get_server_tools_reports_disabled_tools() {
        let manager = ConnectionManager::new();
        let mut def = definition("echo-server");
        def.disabled_tools = Some(["blocked".to_string()].into());

        let transport = Arc::new(MockTransport::new().with_result(
            methods::LIST_TOOLS,
            serde_json::json!({"tools": [{"name": "blocked", "inputSchema": {"type": "object"}}]}),
        ));
        manager.attach("echo", &def, transport).await.unwrap();

        // Discovery still reports the tool; only the catalog filters it
        let tools = manager.get_server_tools("echo").await;
        assert_eq!(tools.tools.len(), 1);
        assert!(tools.tools[0].disabled);
    }

    #[tokio::test]
    async fn test_attach_twice_replaces_connection() {
        let manager = ConnectionManager::new();
        let first = Arc::new(MockTransport::new());
        let second = Arc::new(
            MockTransport::new().with_result(
                methods::LIST_TOOLS,
                serde_json::json!({"tools": [{"name": "fresh", "inputSchema": {"type": "object"}}]}),
            ),
        );

        manager.attach("echo", &definition("echo-server"), first).await.unwrap();
        manager.attach("echo", &definition("echo-server"), second).await.unwrap();

        // Only the second connection is live
        assert_eq!(manager.get_available_servers().await, vec!["echo".to_string()]);
        let tools = manager.get_server_tools("echo").await;
        assert_eq!(tools.tools.len(), 1);
        assert_eq!(tools.tools[0].name, "fresh");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_server_is_noop() {
        let manager = ConnectionManager::new();
        manager.disconnect("ghost").await;
        assert!(manager.get_available_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let manager = ConnectionManager::new();
        manager.attach("echo", &definition("echo-server"), Arc::new(MockTransport::new())).await.unwrap();

        manager.disconnect("echo").await;

        assert!(manager.server_status("echo").await.is_none());
        let err = manager.call_tool("echo", "ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_config_empty_clears_connections() {
        let manager = ConnectionManager::new();
        manager.attach("echo", &definition("echo-server"), Arc::new(MockTransport::new())).await.unwrap();

        manager.load_config(&Configuration::default()).await.unwrap();

        assert!(manager.get_available_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_ping_routes_to_server() {
        let manager = ConnectionManager::new();
        let transport =
            Arc::new(MockTransport::new().with_result(methods::PING, serde_json::json!({"pong": true})));
        manager.attach("echo", &definition("echo-server"), transport).await.unwrap();

        let result = manager.ping("echo").await.unwrap();
        assert_eq!(result["pong"], true);
    }
}
