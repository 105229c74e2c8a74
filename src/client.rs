//! Backend client - MCP protocol over a transport
//!
//! Wraps a [`Transport`] with the MCP handshake and the typed category RPCs.
//! Only after `initialize` succeeds and the `initialized` notification is
//! sent does the client accept category requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config_store::TransportSpec;
use crate::protocol::{
    PROTOCOL_VERSION, Prompt, PromptsListResult, Resource, ResourceTemplate, ResourcesListResult,
    ResourcesTemplatesListResult, Tool, ToolsListResult,
};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Initial transport handshake policy
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Total connection attempts
    pub attempts: u32,
    /// Fixed gap between attempts
    pub gap: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            gap: Duration::from_millis(2500),
        }
    }
}

/// Per-call retry policy for connection-closed failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt
    pub max_retries: u32,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff multiplier (2.0 yields the 1s, 2s schedule)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create the backoff schedule for one call
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Client for one downstream MCP server
pub struct BackendClient {
    /// Backend name
    pub name: String,
    /// Launch spec used to (re)build the transport; `None` for pre-built
    /// transports, which then cannot be relaunched
    spec: Option<TransportSpec>,
    /// Per-call timeout ceiling
    timeout: Duration,
    /// Live transport
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Handshake policy
    connect_policy: ConnectPolicy,
    /// Per-call retry policy
    retry: RetryPolicy,
}

impl BackendClient {
    /// Create a client that launches its own transport from a spec
    #[must_use]
    pub fn new(name: &str, spec: TransportSpec, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            spec: Some(spec),
            timeout,
            transport: RwLock::new(None),
            connect_policy: ConnectPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a client over a pre-built transport (used behind test
    /// connectors; the transport cannot be relaunched on failure)
    #[must_use]
    pub fn with_transport(name: &str, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            spec: None,
            timeout,
            transport: RwLock::new(Some(transport)),
            connect_policy: ConnectPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the connect and retry policies
    #[must_use]
    pub fn with_policies(mut self, connect: ConnectPolicy, retry: RetryPolicy) -> Self {
        self.connect_policy = connect;
        self.retry = retry;
        self
    }

    /// Connect and complete the MCP handshake, retrying per the connect policy
    ///
    /// # Errors
    ///
    /// Returns the last handshake error once all attempts are exhausted.
    pub async fn connect(&self) -> Result<()> {
        let mut last_err = None;

        for attempt in 1..=self.connect_policy.attempts {
            match self.try_connect().await {
                Ok(()) => {
                    info!(backend = %self.name, attempt, "Backend connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(backend = %self.name, attempt, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                    if attempt < self.connect_policy.attempts {
                        sleep(self.connect_policy.gap).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Internal("connect without attempts".to_string())))
    }

    /// One transport build + handshake attempt
    async fn try_connect(&self) -> Result<()> {
        let transport: Arc<dyn Transport> = match &self.spec {
            Some(spec) => build_transport(spec, self.timeout).await?,
            None => self
                .transport
                .read()
                .clone()
                .ok_or_else(|| Error::Internal("No transport to reconnect".to_string()))?,
        };

        self.handshake(transport.as_ref()).await?;

        *self.transport.write() = Some(transport);
        Ok(())
    }

    /// `initialize` followed by the `initialized` notification
    async fn handshake(&self, transport: &dyn Transport) -> Result<()> {
        let response = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-proxy-router",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!(
                "Initialize failed: {} ({})",
                error.message, error.code
            )));
        }

        transport.notify("notifications/initialized", None).await?;
        debug!(backend = %self.name, "Handshake complete");

        Ok(())
    }

    /// Send a request; reconnect and retry on connection-closed failures.
    ///
    /// Retries follow the configured linear schedule; all other failures
    /// surface immediately. Returns the JSON-RPC `result` payload.
    ///
    /// # Errors
    ///
    /// Returns the mapped JSON-RPC or transport error.
    #[tracing::instrument(skip(self, params), fields(backend = %self.name))]
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.request_once(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_connection_closed() && attempt <= self.retry.max_retries => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.retry.initial_backoff);
                    warn!(
                        backend = %self.name,
                        method,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Connection closed mid-call; reconnecting"
                    );
                    sleep(delay).await;
                    if let Err(re) = self.try_connect().await {
                        warn!(backend = %self.name, error = %re, "Reconnect failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single request attempt, JSON-RPC error responses mapped to `Err`
    async fn request_once(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::ServerUnavailable(self.name.clone()))?;

        let response = transport.request(method, params).await?;

        if let Some(error) = response.error {
            return Err(Error::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// `tools/list` - a missing method here is fatal, unlike the optional
    /// categories
    ///
    /// # Errors
    ///
    /// Returns transport and JSON-RPC failures unchanged.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result = self.request("tools/list", None).await?;
        if result.is_null() {
            return Ok(vec![]);
        }
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    /// `tools/call`
    ///
    /// # Errors
    ///
    /// Returns transport and JSON-RPC failures unchanged.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// `prompts/list`; servers without the prompts category yield an empty list
    ///
    /// # Errors
    ///
    /// Returns failures other than method-not-found unchanged.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        match self.request("prompts/list", None).await {
            Ok(result) => {
                if result.is_null() {
                    return Ok(vec![]);
                }
                let parsed: PromptsListResult = serde_json::from_value(result)?;
                Ok(parsed.prompts)
            }
            Err(e) if is_method_not_found(&e) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// `prompts/get`
    ///
    /// # Errors
    ///
    /// Returns transport and JSON-RPC failures unchanged.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<Value> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = json!(args);
        }
        self.request("prompts/get", Some(params)).await
    }

    /// `resources/list`; servers without the resources category yield an
    /// empty list
    ///
    /// # Errors
    ///
    /// Returns failures other than method-not-found unchanged.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        match self.request("resources/list", None).await {
            Ok(result) => {
                if result.is_null() {
                    return Ok(vec![]);
                }
                let parsed: ResourcesListResult = serde_json::from_value(result)?;
                Ok(parsed.resources)
            }
            Err(e) if is_method_not_found(&e) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// `resources/read`
    ///
    /// # Errors
    ///
    /// Returns transport and JSON-RPC failures unchanged.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    /// `resources/templates/list`; optional like the other resource methods
    ///
    /// # Errors
    ///
    /// Returns failures other than method-not-found unchanged.
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        match self.request("resources/templates/list", None).await {
            Ok(result) => {
                if result.is_null() {
                    return Ok(vec![]);
                }
                let parsed: ResourcesTemplatesListResult = serde_json::from_value(result)?;
                Ok(parsed.resource_templates)
            }
            Err(e) if is_method_not_found(&e) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// Whether the underlying transport reports itself connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    /// Close the transport
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close cleanly.
    pub async fn close(&self) -> Result<()> {
        let transport = self.transport.write().take();
        if let Some(t) = transport {
            t.close().await?;
        }
        Ok(())
    }
}

fn is_method_not_found(error: &Error) -> bool {
    matches!(
        error,
        Error::JsonRpc {
            code: crate::error::rpc_codes::METHOD_NOT_FOUND,
            ..
        }
    )
}

/// Build and start the transport for a launch spec
async fn build_transport(spec: &TransportSpec, timeout: Duration) -> Result<Arc<dyn Transport>> {
    match spec {
        TransportSpec::Command { command, args, env } => {
            let transport = StdioTransport::new(command, args, env.clone(), timeout);
            transport.start().await?;
            Ok(transport)
        }
        TransportSpec::Sse { url, headers } | TransportSpec::StreamableHttp { url, headers } => {
            let transport = HttpTransport::new(url, headers.clone(), timeout)?;
            Ok(transport)
        }
    }
}

/// Seam between the active set and the transport layer.
///
/// The production implementation launches a real backend and drives the
/// handshake; tests substitute in-memory transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Launch a backend, complete its handshake, and return the ready client
    async fn connect(
        &self,
        name: &str,
        spec: &TransportSpec,
        timeout: Duration,
    ) -> Result<Arc<BackendClient>>;
}

/// Production connector
pub struct McpConnector;

#[async_trait]
impl Connector for McpConnector {
    async fn connect(
        &self,
        name: &str,
        spec: &TransportSpec,
        timeout: Duration,
    ) -> Result<Arc<BackendClient>> {
        let client = Arc::new(BackendClient::new(name, spec.clone(), timeout));
        client.connect().await?;
        Ok(client)
    }
}
