//! Normalization of raw tool-call responses
//!
//! A call can succeed at the transport level and still fail at the content
//! level: the server may flag an application error, return no text, or
//! return text that does not decode as structured data. This module owns
//! that classification so the manager and catalog never inspect payloads
//! themselves.

use serde_json::Value;

use crate::manager::{CallResult, ClientError};
use crate::protocol::CallToolResult;

/// Normalize a `tools/call` result into a [`CallResult`] or a typed failure
///
/// Failure ladder: `isError` -> `ToolReturnedError`; no text block ->
/// `EmptyContent`; text that is not valid JSON -> `UnparsableContent`.
pub fn parse_call_result(
    server_name: &str,
    tool_name: &str,
    result: &CallToolResult,
    raw: Value,
) -> Result<CallResult, ClientError> {
    if result.is_error {
        return Err(ClientError::ToolReturnedError {
            server: server_name.to_string(),
            tool: tool_name.to_string(),
        });
    }

    let text = result
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .find_map(|block| block.text.as_deref())
        .filter(|text| !text.is_empty());

    let Some(text) = text else {
        return Err(ClientError::EmptyContent {
            server: server_name.to_string(),
            tool: tool_name.to_string(),
        });
    };

    let data = serde_json::from_str(text).map_err(|source| ClientError::UnparsableContent {
        server: server_name.to_string(),
        tool: tool_name.to_string(),
        source,
    })?;

    Ok(CallResult { data, raw })
}
