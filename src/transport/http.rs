//! HTTP transport implementation (SSE handshake and Streamable HTTP)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, header};
use serde_json::Value;
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// HTTP transport for remote MCP servers
///
/// Covers both wire dialects: the SSE-handshake style where responses come
/// back as `text/event-stream` bodies, and Streamable HTTP where a plain JSON
/// body is returned. The dialect is chosen per catalog entry.
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Base URL
    url: String,
    /// Custom headers
    headers: HashMap<String, String>,
    /// Session ID (from server)
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            headers,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }))
    }

    /// Send a raw request
    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.build_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        // Extract session ID from response headers
        if let Some(session_id) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP error: {status}")));
        }

        // Check content type for SSE
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let parsed = if content_type.contains("text/event-stream") {
            self.parse_sse_response(response).await
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        };

        if parsed.is_ok() {
            self.connected.store(true, Ordering::Relaxed);
        }

        parsed
    }

    /// Parse SSE response to get JSON-RPC response
    async fn parse_sse_response(&self, response: reqwest::Response) -> Result<JsonRpcResponse> {
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        // Find the data line
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                return serde_json::from_str(data).map_err(|e| Error::Transport(e.to_string()));
            }
        }

        Err(Error::Transport("No data in SSE response".to_string()))
    }

    /// Build the request headers for one call
    fn build_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().unwrap(),
        );
        headers.insert("MCP-Protocol-Version", PROTOCOL_VERSION.parse().unwrap());

        if let Some(ref session_id) = *self.session_id.read() {
            if let Ok(v) = session_id.parse() {
                headers.insert("MCP-Session-Id", v);
            }
        }

        for (key, value) in &self.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                headers.insert(k, v);
            }
        }

        headers
    }

    /// Get next request ID
    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id(),
            method: method.to_string(),
            params,
        };

        self.send_request(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .headers(self.build_headers())
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification failed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Send session termination if we have a session ID
        let session_id = self.session_id.read().clone();
        if let Some(ref id) = session_id {
            debug!(session_id = %id, url = %self.url, "Terminating remote session");
            let _ = self
                .client
                .delete(&self.url)
                .header("MCP-Session-Id", id)
                .send()
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transport() -> Arc<HttpTransport> {
        HttpTransport::new(
            "http://localhost:9000/mcp",
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn new_stores_url() {
        let t = make_transport();
        assert_eq!(t.url, "http://localhost:9000/mcp");
        assert!(!t.is_connected());
    }

    #[test]
    fn next_id_increments() {
        let t = make_transport();
        assert_eq!(t.next_id(), RequestId::Number(1));
        assert_eq!(t.next_id(), RequestId::Number(2));
    }

    #[test]
    fn headers_include_protocol_version() {
        let t = make_transport();
        let headers = t.build_headers();
        assert_eq!(
            headers.get("MCP-Protocol-Version").unwrap(),
            PROTOCOL_VERSION
        );
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }

    #[test]
    fn headers_include_custom_and_session() {
        let mut custom = HashMap::new();
        custom.insert("Authorization".to_string(), "Bearer token123".to_string());
        let t = HttpTransport::new("http://x/mcp", custom, Duration::from_secs(1)).unwrap();
        *t.session_id.write() = Some("sess-1".to_string());

        let headers = t.build_headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer token123");
        assert_eq!(headers.get("MCP-Session-Id").unwrap(), "sess-1");
    }
}
