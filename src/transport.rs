//! Subprocess transport for tool servers
//!
//! A [`StdioTransport`] spawns the server as a child process and exchanges
//! newline-delimited JSON-RPC frames over its stdin/stdout. Responses are
//! correlated to requests by id; the child's stderr is drained into a
//! diagnostic buffer and never terminates the connection. A request that
//! exceeds its deadline closes the link: the read was cancelled mid-frame, so
//! the stream cannot be trusted afterwards.
//!
//! The [`Transport`] trait is the seam for tests and for callers that want to
//! attach a pre-built transport instead of spawning a process.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::{JsonRpcFrame, JsonRpcRequest};

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a child to exit after closing its stdin before
/// killing it
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Errors raised by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport closed by server")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame from server: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Request/response primitives over a single tool-server link
///
/// One request is in flight per transport at a time: `request` holds the io
/// lock until its response arrives, so callers sharing a transport are
/// serialized while different transports proceed concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a request and wait for the correlated response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    /// Send a one-way notification
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Close the link, releasing any underlying process
    async fn close(&self) -> Result<(), TransportError>;

    /// Drain captured stderr lines accumulated since the last drain
    fn drain_stderr(&self) -> Vec<String> {
        Vec::new()
    }
}

struct TransportIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// JSON-RPC over a spawned child process's stdin/stdout
pub struct StdioTransport {
    command: String,
    io: Mutex<Option<TransportIo>>,
    next_id: AtomicU64,
    timeout: Duration,
    stderr_lines: Arc<StdMutex<Vec<String>>>,
    stderr_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn a tool-server subprocess
    ///
    /// The child gets exactly the definition's env entries plus the parent's
    /// PATH (unless the definition overrides PATH). stdin/stdout are piped
    /// for the protocol; stderr is drained into the diagnostic buffer.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        debug!(%command, args = args.len(), "StdioTransport::spawn: called");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;
        let stderr = child.stderr.take();

        let stderr_lines = Arc::new(StdMutex::new(Vec::new()));
        let stderr_task = stderr.map(|stderr| {
            let lines = stderr_lines.clone();
            let server_command = command.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    warn!(command = %server_command, stderr = %line, "tool server stderr");
                    if let Ok(mut buf) = lines.lock() {
                        buf.push(line);
                    }
                }
            })
        });

        Ok(Self {
            command: command.to_string(),
            io: Mutex::new(Some(TransportIo {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            })),
            next_id: AtomicU64::new(1),
            timeout,
            stderr_lines,
            stderr_task: StdMutex::new(stderr_task),
        })
    }

    async fn write_frame(io: &mut TransportIo, frame: &JsonRpcRequest) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.flush().await?;
        Ok(())
    }

    /// Read frames until the response matching `id` arrives
    ///
    /// Notifications and unmatched responses from the child are skipped.
    async fn read_response(io: &mut TransportIo, id: u64) -> Result<Value, TransportError> {
        loop {
            let mut line = String::new();
            let bytes = io.stdout.read_line(&mut line).await?;
            if bytes == 0 {
                return Err(TransportError::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let frame: JsonRpcFrame = serde_json::from_str(trimmed)?;
            if frame.id != Some(id) {
                debug!(method = ?frame.method, id = ?frame.id, "StdioTransport: skipping unsolicited frame");
                continue;
            }
            if let Some(err) = frame.error {
                return Err(TransportError::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            return Ok(frame.result.unwrap_or(Value::Null));
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(command = %self.command, %method, id, "StdioTransport::request: called");

        let frame = JsonRpcRequest::new(id, method, params);
        let deadline = self.timeout;

        let result = tokio::time::timeout(deadline, async {
            let mut guard = self.io.lock().await;
            let io = guard.as_mut().ok_or(TransportError::Closed)?;
            Self::write_frame(io, &frame).await?;
            Self::read_response(io, id).await
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => {
                // A cancelled read leaves partial bytes on the stream, so the
                // link cannot carry another request.
                warn!(command = %self.command, %method, "StdioTransport::request: timed out, closing link");
                let _ = self.close().await;
                Err(TransportError::Timeout(deadline))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        debug!(command = %self.command, %method, "StdioTransport::notify: called");

        let frame = JsonRpcRequest::notification(method, params);
        let deadline = self.timeout;

        let result = tokio::time::timeout(deadline, async {
            let mut guard = self.io.lock().await;
            let io = guard.as_mut().ok_or(TransportError::Closed)?;
            Self::write_frame(io, &frame).await
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => {
                // A cancelled write may have emitted a partial frame
                warn!(command = %self.command, %method, "StdioTransport::notify: timed out, closing link");
                let _ = self.close().await;
                Err(TransportError::Timeout(deadline))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!(command = %self.command, "StdioTransport::close: called");

        let Some(mut io) = self.io.lock().await.take() else {
            return Ok(());
        };

        // Closing stdin asks the server to exit; kill it if it lingers.
        let _ = io.stdin.shutdown().await;
        drop(io.stdin);
        if tokio::time::timeout(CLOSE_GRACE, io.child.wait()).await.is_err() {
            warn!(command = %self.command, "StdioTransport::close: child did not exit, killing");
            io.child.start_kill()?;
            io.child.wait().await?;
        }

        if let Ok(mut task) = self.stderr_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        Ok(())
    }

    fn drain_stderr(&self) -> Vec<String> {
        self.stderr_lines.lock().map(|mut buf| std::mem::take(&mut *buf)).unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_unknown_command_fails() {
        let err = StdioTransport::spawn(
            "definitely-not-a-real-binary-xyz",
            &[],
            &BTreeMap::new(),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .map(|_| ())
        .unwrap_err();

        match err {
            TransportError::Spawn { command, .. } => {
                assert_eq!(command, "definitely-not-a-real-binary-xyz");
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_times_out_on_silent_server() {
        // consumes stdin without ever answering
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), "read -r line; sleep 30".to_string()],
            &BTreeMap::new(),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        // The timed-out link was closed; it cannot carry another request
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_stderr_is_captured_not_fatal() {
        let script = r#"echo "something went sideways" >&2
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result["ok"], true);

        // stderr output was collected as diagnostics without killing the link
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stderr = transport.drain_stderr();
        assert_eq!(stderr, vec!["something went sideways".to_string()]);

        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_code_and_message() {
        let script = r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = transport.request("nope", None).await.unwrap_err();
        match err {
            TransportError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("Expected Rpc error, got {other:?}"),
        }

        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_unsolicited_frames_are_skipped() {
        let script = r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/progress","params":{}}'
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"answer":42}}'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result["answer"], 42);

        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let script = "read -r line";
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        transport.close().await.unwrap();

        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_child_env_includes_parent_path() {
        // Child sees PATH from the parent plus the definition's env
        let mut env = BTreeMap::new();
        env.insert("TB_MARKER".to_string(), "present".to_string());

        let script = r#"read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"path_set":"%s","marker":"%s"}}\n' "${PATH:+yes}" "$TB_MARKER""#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &env,
            Duration::from_secs(5),
        )
        .unwrap();

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result["path_set"], "yes");
        assert_eq!(result["marker"], "present");

        let _ = transport.close().await;
    }
}
