//! A single live tool-server connection
//!
//! Each connection wraps one subprocess-backed transport and tracks the
//! status state machine: `Connecting -> Connected | Disconnected`. The
//! initialize handshake promotes a connection to `Connected`; handshake
//! failure or teardown demotes it to `Disconnected` with `last_error` set.
//! Child stderr is appended to `last_error` as diagnostics without affecting
//! the status.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::ServerDefinition;
use crate::protocol::{methods, ListToolsResult, ToolInfo, PROTOCOL_VERSION};
use crate::transport::{StdioTransport, Transport, TransportError};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One tool-server connection owned by the manager
pub struct ServerConnection {
    name: String,
    definition: ServerDefinition,
    status: ConnectionStatus,
    last_error: Option<String>,
    transport: Option<Arc<dyn Transport>>,
}

impl ServerConnection {
    /// Create a connection that will spawn its own subprocess on
    /// [`ServerConnection::establish`]
    pub fn new(name: impl Into<String>, definition: ServerDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
            status: ConnectionStatus::Connecting,
            last_error: None,
            transport: None,
        }
    }

    /// Create a connection over a pre-built transport
    ///
    /// The handshake still runs on [`ServerConnection::establish`]; this is
    /// the entry point for custom transports and tests.
    pub fn from_transport(
        name: impl Into<String>,
        definition: ServerDefinition,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            definition,
            status: ConnectionStatus::Connecting,
            last_error: None,
            transport: Some(transport),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Diagnostic error state: the last handshake failure plus any stderr
    /// output captured from the child, newline-joined
    pub fn last_error(&mut self) -> Option<String> {
        self.absorb_stderr();
        self.last_error.clone()
    }

    /// Spawn (if needed) and run the initialize handshake
    ///
    /// On success the status becomes `Connected` and `last_error` is
    /// cleared; on failure the status becomes `Disconnected`, `last_error`
    /// records the failure, and the error is re-raised.
    pub async fn establish(&mut self, request_timeout: Duration) -> Result<(), TransportError> {
        debug!(server = %self.name, "ServerConnection::establish: called");
        self.status = ConnectionStatus::Connecting;

        if self.transport.is_none() {
            let transport = StdioTransport::spawn(
                &self.definition.command,
                &self.definition.args,
                &self.definition.env,
                request_timeout,
            );
            match transport {
                Ok(t) => self.transport = Some(Arc::new(t)),
                Err(e) => {
                    self.status = ConnectionStatus::Disconnected;
                    self.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        match self.handshake().await {
            Ok(_) => {
                // Fresh session: discard any stderr noise from startup
                if let Some(transport) = &self.transport {
                    let _ = transport.drain_stderr();
                }
                self.status = ConnectionStatus::Connected;
                self.last_error = None;
                info!(server = %self.name, "ServerConnection::establish: connected");
                Ok(())
            }
            Err(e) => {
                self.status = ConnectionStatus::Disconnected;
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Value, TransportError> {
        let transport = self.live_transport()?;
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        let result = transport.request(methods::INITIALIZE, Some(params)).await?;
        transport.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    /// Handle for issuing requests without holding the manager lock
    ///
    /// Returns `None` unless the connection is currently `Connected`.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        if self.status != ConnectionStatus::Connected {
            return None;
        }
        self.transport.as_ref().map(|transport| ConnectionHandle {
            server_name: self.name.clone(),
            definition: self.definition.clone(),
            transport: transport.clone(),
        })
    }

    /// Force the connection into `Disconnected`, recording `reason`, and
    /// release the subprocess
    ///
    /// Used when a request failure proves the link unusable (a timed-out
    /// request cancels a read mid-frame).
    pub async fn abort(&mut self, reason: impl Into<String>) {
        self.absorb_stderr();
        self.status = ConnectionStatus::Disconnected;
        let reason = reason.into();
        self.last_error = Some(match self.last_error.take() {
            Some(existing) => format!("{reason}\n{existing}"),
            None => reason,
        });
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(server = %self.name, error = %e, "ServerConnection::abort: close failed");
            }
        }
    }

    /// Tear down the connection, releasing the subprocess
    ///
    /// The status becomes `Disconnected` regardless of whether the close
    /// itself succeeded.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        debug!(server = %self.name, "ServerConnection::shutdown: called");
        self.absorb_stderr();
        self.status = ConnectionStatus::Disconnected;
        match self.transport.take() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn live_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.transport.clone().ok_or(TransportError::Closed)
    }

    fn absorb_stderr(&mut self) {
        let Some(transport) = &self.transport else { return };
        let lines = transport.drain_stderr();
        if lines.is_empty() {
            return;
        }
        let joined = lines.join("\n");
        self.last_error = Some(match self.last_error.take() {
            Some(existing) => format!("{existing}\n{joined}"),
            None => joined,
        });
    }
}

/// A cheap clone of a connected server's request surface
///
/// Handles let discovery and tool calls run after the manager lock is
/// released; requests on one handle are still serialized by the transport.
#[derive(Clone)]
pub struct ConnectionHandle {
    server_name: String,
    definition: ServerDefinition,
    transport: Arc<dyn Transport>,
}

impl ConnectionHandle {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Discover the server's tools, annotating each with the definition's
    /// enable/disable lists (deny wins)
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        debug!(server = %self.server_name, "ConnectionHandle::list_tools: called");

        let raw = self.transport.request(methods::LIST_TOOLS, None).await?;
        let result: ListToolsResult = serde_json::from_value(raw)?;

        let tools = result
            .tools
            .into_iter()
            .map(|mut tool| {
                tool.disabled = self.definition.is_tool_disabled(&tool.name);
                tool
            })
            .collect();
        Ok(tools)
    }

    /// Invoke a tool, returning the raw protocol response
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, TransportError> {
        debug!(server = %self.server_name, tool = %tool_name, "ConnectionHandle::call_tool: called");

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        self.transport.request(methods::CALL_TOOL, Some(params)).await
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<Value, TransportError> {
        self.transport.request(methods::PING, None).await
    }
}
