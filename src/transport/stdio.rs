//! Stdio transport implementation (subprocess)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, warn};

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// How long to wait for a clean child exit after stdin closes before killing.
const GRACEFUL_EXIT_DEADLINE: Duration = Duration::from_secs(2);

/// Stdio transport for subprocess MCP servers
///
/// Frames JSON-RPC as newline-delimited messages on the child's stdin/stdout.
/// Stderr is forwarded to the log, never to the upstream client.
pub struct StdioTransport {
    /// Child process
    child: Mutex<Option<Child>>,
    /// Pending requests waiting for response
    pending: dashmap::DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
    /// Program to execute
    program: String,
    /// Program arguments
    args: Vec<String>,
    /// Environment variables (merged over the inherited environment)
    env: HashMap<String, String>,
    /// Per-request timeout ceiling
    timeout: Duration,
    /// Writer handle
    writer: Mutex<Option<tokio::process::ChildStdin>>,
}

impl StdioTransport {
    /// Create a new stdio transport
    #[must_use]
    pub fn new(
        program: &str,
        args: &[String],
        env: HashMap<String, String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            child: Mutex::new(None),
            pending: dashmap::DashMap::new(),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            program: program.to_string(),
            args: args.to_vec(),
            env,
            timeout,
            writer: Mutex::new(None),
        })
    }

    /// Start the subprocess
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.program.is_empty() {
            return Err(Error::Config("Empty command".to_string()));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn {}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stderr".to_string()))?;

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Stderr goes to the log only
        let program = self.program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(command = %program, stderr = %line, "Backend stderr");
            }
        });

        // Spawn reader task
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Reader task started");
            let mut reader = BufReader::new(stdout).lines();

            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if let Err(e) = transport.handle_message(&line) {
                            error!(error = %e, line = %line, "Failed to handle message");
                        }
                    }
                    Ok(None) => {
                        debug!("Stdout EOF reached - process exited");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading from stdout");
                        break;
                    }
                }
            }

            transport.connected.store(false, Ordering::Relaxed);
            transport.drain_pending();
            debug!("Stdio reader task ended");
        });

        self.connected.store(true, Ordering::Relaxed);
        debug!(command = %self.program, "Stdio transport started");

        Ok(())
    }

    /// Handle a message line from stdout
    fn handle_message(&self, line: &str) -> Result<()> {
        let response: JsonRpcResponse = serde_json::from_str(line)?;

        if let Some(ref id) = response.id {
            let key = id.to_string();
            if let Some((_, sender)) = self.pending.remove(&key) {
                let _ = sender.send(response);
            } else {
                debug!(id = %key, "No pending request found for response");
            }
        } else {
            // Server-initiated notification; nothing routes these upstream
            debug!(line = %line, "Backend notification");
        }

        Ok(())
    }

    /// Fail every pending request with a uniform transport-closed error.
    ///
    /// Dropping the waiter's sender makes `request` observe a closed channel,
    /// which it reports as `transport closed`.
    fn drain_pending(&self) {
        let keys: Vec<String> = self.pending.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            if self.pending.remove(&key).is_some() {
                debug!(id = %key, "Draining pending request after transport close");
            }
        }
    }

    /// Write a message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(ref mut stdin) = *writer {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            stdin
                .flush()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            drop(writer);
            // Yield to give the runtime a chance to process the I/O
            tokio::task::yield_now().await;
            Ok(())
        } else {
            Err(Error::Transport("Not connected".to_string()))
        }
    }

    /// Get next request ID
    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_message(&message).await {
            self.pending.remove(&id.to_string());
            return Err(e);
        }

        // Wait for response with timeout
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("transport closed".to_string())),
            Err(_) => {
                self.pending.remove(&id.to_string());
                Err(Error::Timeout(format!(
                    "Request timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let message = serde_json::to_string(&notification)?;
        self.write_message(&message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Closing stdin asks the child to exit on its own
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(GRACEFUL_EXIT_DEADLINE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(command = %self.program, %status, "Backend exited cleanly");
                }
                Ok(Err(e)) => {
                    warn!(command = %self.program, error = %e, "Failed to await backend exit");
                }
                Err(_) => {
                    warn!(command = %self.program, "Backend did not exit in time; killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.drain_pending();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_transport(program: &str) -> Arc<StdioTransport> {
        StdioTransport::new(program, &[], HashMap::new(), Duration::from_secs(30))
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn new_stores_command_and_defaults() {
        let t = StdioTransport::new(
            "node",
            &["server.js".to_string()],
            HashMap::new(),
            Duration::from_secs(30),
        );
        assert_eq!(t.program, "node");
        assert_eq!(t.args, vec!["server.js".to_string()]);
        assert!(!t.is_connected());
        assert!(t.env.is_empty());
    }

    #[test]
    fn new_with_env() {
        let mut env = HashMap::new();
        env.insert("NODE_ENV".to_string(), "test".to_string());
        let t = StdioTransport::new("node", &[], env, Duration::from_secs(5));
        assert_eq!(t.env.get("NODE_ENV").unwrap(), "test");
        assert_eq!(t.timeout, Duration::from_secs(5));
    }

    // =========================================================================
    // next_id
    // =========================================================================

    #[test]
    fn next_id_increments_sequentially() {
        let t = make_transport("echo");
        assert_eq!(t.next_id(), RequestId::Number(1));
        assert_eq!(t.next_id(), RequestId::Number(2));
        assert_eq!(t.next_id(), RequestId::Number(3));
    }

    // =========================================================================
    // handle_message
    // =========================================================================

    #[test]
    fn handle_message_routes_to_pending_request() {
        let t = make_transport("echo");
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        t.pending.insert("1".to_string(), tx);

        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        t.handle_message(json).unwrap();

        let response = rx.try_recv().unwrap();
        assert!(response.result.is_some());
        assert!(response.error.is_none());
    }

    #[test]
    fn handle_message_string_id() {
        let t = make_transport("echo");
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        t.pending.insert("req-42".to_string(), tx);

        let json = r#"{"jsonrpc":"2.0","id":"req-42","result":{}}"#;
        t.handle_message(json).unwrap();

        let response = rx.try_recv().unwrap();
        assert!(response.result.is_some());
    }

    #[test]
    fn handle_message_no_matching_pending() {
        let t = make_transport("echo");
        // No pending request registered - should not panic
        let json = r#"{"jsonrpc":"2.0","id":99,"result":{}}"#;
        t.handle_message(json).unwrap();
    }

    #[test]
    fn handle_message_error_response() {
        let t = make_transport("echo");
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        t.pending.insert("5".to_string(), tx);

        let json = r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"Method not found"}}"#;
        t.handle_message(json).unwrap();

        let response = rx.try_recv().unwrap();
        assert!(response.error.is_some());
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[test]
    fn handle_message_invalid_json_returns_error() {
        let t = make_transport("echo");
        let result = t.handle_message("not valid json");
        assert!(result.is_err());
    }

    // =========================================================================
    // drain_pending
    // =========================================================================

    #[test]
    fn drain_pending_fails_all_waiters() {
        let t = make_transport("echo");
        let (tx1, mut rx1) = tokio::sync::oneshot::channel();
        let (tx2, mut rx2) = tokio::sync::oneshot::channel();
        t.pending.insert("1".to_string(), tx1);
        t.pending.insert("2".to_string(), tx2);

        t.drain_pending();

        assert!(t.pending.is_empty());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    // =========================================================================
    // is_connected
    // =========================================================================

    #[test]
    fn initially_not_connected() {
        let t = make_transport("echo");
        assert!(!t.is_connected());
    }

    #[test]
    fn connected_flag_toggles() {
        let t = make_transport("echo");
        t.connected.store(true, Ordering::Relaxed);
        assert!(t.is_connected());
        t.connected.store(false, Ordering::Relaxed);
        assert!(!t.is_connected());
    }
}
