//! Flat catalog of invokable tools across all connected servers
//!
//! The catalog is a stateless projection: [`build_catalog`] asks the manager
//! which servers are live, discovers their tools concurrently, and produces
//! one [`CallableTool`] per non-disabled tool keyed `<server>_<tool>`. The
//! server-name prefix guarantees key uniqueness since tool names are only
//! unique within a server.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::manager::{CallResult, ClientError, ConnectionManager};

/// Observer invoked synchronously with `(server_name, tool_name, args)`
/// before each call is issued; it cannot alter the call's outcome.
pub type ToolCallObserver = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// The one exception shape catalog consumers see, regardless of the
/// underlying failure kind
#[derive(Debug, Error)]
#[error("Tool call {qualified_name} failed")]
pub struct ToolExecutionError {
    pub qualified_name: String,
    #[source]
    pub source: ClientError,
}

/// Options for catalog construction
#[derive(Default, Clone)]
pub struct CatalogOptions {
    on_tool_call: Option<ToolCallObserver>,
}

impl CatalogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe in-flight calls without altering their outcome
    pub fn on_tool_call(mut self, observer: impl Fn(&str, &str, &Value) + Send + Sync + 'static) -> Self {
        self.on_tool_call = Some(Arc::new(observer));
        self
    }
}

/// One invokable catalog entry
#[derive(Clone)]
pub struct CallableTool {
    qualified_name: String,
    server_name: String,
    tool_name: String,
    description: String,
    parameters: Value,
    manager: Arc<ConnectionManager>,
    observer: Option<ToolCallObserver>,
}

impl CallableTool {
    /// Catalog key: `<server>_<tool>`
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// JSON-Schema-shaped parameter schema mirrored from discovery
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Invoke the tool through the manager
    ///
    /// Every manager failure is rewrapped as [`ToolExecutionError`] carrying
    /// the original cause.
    pub async fn execute(&self, args: Value) -> Result<CallResult, ToolExecutionError> {
        if let Some(observer) = &self.observer {
            observer(&self.server_name, &self.tool_name, &args);
        }

        self.manager
            .call_tool(&self.server_name, &self.tool_name, args)
            .await
            .map_err(|source| ToolExecutionError {
                qualified_name: self.qualified_name.clone(),
                source,
            })
    }
}

/// Mapping from qualified tool name to callable entry
pub type ToolCatalog = BTreeMap<String, CallableTool>;

/// Build the catalog from the manager's currently connected servers
///
/// Discovery runs concurrently across servers (calls against one server are
/// still serialized by its transport). Tools excluded by a server's
/// deny-list never appear, even though discovery reports them.
pub async fn build_catalog(manager: &Arc<ConnectionManager>, options: CatalogOptions) -> ToolCatalog {
    let servers = manager.get_available_servers().await;
    debug!(servers = servers.len(), "build_catalog: called");

    let fetches = servers.iter().map(|name| manager.get_server_tools(name));
    let discovered = join_all(fetches).await;

    let mut catalog = ToolCatalog::new();
    for server_tools in discovered {
        for tool in server_tools.tools {
            if tool.disabled {
                debug!(server = %server_tools.server_name, tool = %tool.name, "build_catalog: tool disabled");
                continue;
            }
            let qualified_name = format!("{}_{}", server_tools.server_name, tool.name);
            catalog.insert(
                qualified_name.clone(),
                CallableTool {
                    qualified_name,
                    server_name: server_tools.server_name.clone(),
                    tool_name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                    manager: manager.clone(),
                    observer: options.on_tool_call.clone(),
                },
            );
        }
    }
    catalog
}
