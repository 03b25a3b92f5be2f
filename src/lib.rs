//! Toolbridge - tool-server connectivity for agent toolkits
//!
//! Toolbridge lets a language-model-driven process discover and invoke
//! external tools hosted by independently running server subprocesses,
//! speaking a JSON-RPC request/response protocol over stdin/stdout.
//!
//! # Core Concepts
//!
//! - **One manager per session**: a [`ConnectionManager`] owns every live
//!   connection; there is no ambient singleton
//! - **At most one connection per name**: reconnecting a server always tears
//!   down the previous subprocess first
//! - **Best-effort discovery, fail-fast calls**: `get_server_tools` reports
//!   failures as an empty tool list, `call_tool` surfaces every failure
//! - **Tools are projections**: the catalog is recomputed from live
//!   connections, never stored durably
//!
//! # Modules
//!
//! - [`config`] - server definitions, env interpolation, file loading
//! - [`protocol`] - JSON-RPC frame and result shapes
//! - [`transport`] - subprocess spawning and request/response plumbing
//! - [`connection`] - per-server connection state machine
//! - [`manager`] - the connection manager and error taxonomy
//! - [`catalog`] - the flat `<server>_<tool>` catalog of callable tools
//! - [`response`] - normalization of tool-call payloads

pub mod catalog;
pub mod config;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod response;
pub mod transport;

// Re-export commonly used types
pub use catalog::{build_catalog, CallableTool, CatalogOptions, ToolCallObserver, ToolCatalog, ToolExecutionError};
pub use config::{ConfigError, Configuration, ServerDefinition};
pub use connection::{ConnectionHandle, ConnectionStatus, ServerConnection};
pub use manager::{CallResult, ClientError, ConnectionManager, ServerTools};
pub use protocol::{CallToolResult, ContentBlock, ToolInfo};
pub use transport::{StdioTransport, Transport, TransportError, DEFAULT_REQUEST_TIMEOUT};
