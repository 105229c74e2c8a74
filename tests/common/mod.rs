//! Shared test harness: in-memory backends and a scripted connector

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use mcp_proxy_router::client::{BackendClient, ConnectPolicy, Connector, RetryPolicy};
use mcp_proxy_router::config_store::TransportSpec;
use mcp_proxy_router::protocol::{JsonRpcResponse, RequestId};
use mcp_proxy_router::transport::Transport;
use mcp_proxy_router::{Error, Result};

/// In-memory MCP server; responds to the standard category methods
pub struct FakeTransport {
    /// Backend name, echoed into tool call results for routing assertions
    pub name: String,
    /// Raw tool definitions served by `tools/list`
    pub tools: Vec<Value>,
    /// Prompts; `None` answers -32601 (category unsupported)
    pub prompts: Option<Vec<Value>>,
    /// Resources; `None` answers -32601
    pub resources: Option<Vec<Value>>,
    connected: AtomicBool,
    /// Every request method + params seen
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn new(name: &str, tools: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools,
            prompts: None,
            resources: None,
            connected: AtomicBool::new(true),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn with_prompts(name: &str, tools: Vec<Value>, prompts: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools,
            prompts: Some(prompts),
            resources: None,
            connected: AtomicBool::new(true),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        self.calls
            .lock()
            .push((method.to_string(), params.clone().unwrap_or(Value::Null)));

        let id = RequestId::Number(1);
        let method_not_found =
            |id| Ok(JsonRpcResponse::error(Some(id), -32601, "Method not found"));

        match method {
            "initialize" => Ok(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": self.name, "version": "0.0.1"}
                }),
            )),
            "tools/list" => Ok(JsonRpcResponse::success(
                id,
                json!({"tools": self.tools}),
            )),
            "tools/call" => {
                let tool = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Ok(JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{"type": "text", "text": format!("{}::{tool}", self.name)}],
                        "isError": false
                    }),
                ))
            }
            "prompts/list" => match &self.prompts {
                Some(prompts) => Ok(JsonRpcResponse::success(
                    id,
                    json!({"prompts": prompts}),
                )),
                None => method_not_found(id),
            },
            "prompts/get" => {
                let prompt = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Ok(JsonRpcResponse::success(
                    id,
                    json!({
                        "description": format!("{}::{prompt}", self.name),
                        "messages": []
                    }),
                ))
            }
            "resources/list" => match &self.resources {
                Some(resources) => Ok(JsonRpcResponse::success(
                    id,
                    json!({"resources": resources}),
                )),
                None => method_not_found(id),
            },
            "resources/read" => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Ok(JsonRpcResponse::success(
                    id,
                    json!({
                        "contents": [{"uri": uri, "text": format!("{}::{uri}", self.name)}]
                    }),
                ))
            }
            "resources/templates/list" => method_not_found(id),
            _ => method_not_found(id),
        }
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<()> {
        self.calls
            .lock()
            .push((format!("notify:{method}"), Value::Null));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands out fake transports by backend name
pub struct FakeConnector {
    backends: Mutex<HashMap<String, Arc<FakeTransport>>>,
    /// Names whose connect attempts fail
    pub fail: Mutex<HashSet<String>>,
    /// Every name connected, in order
    pub connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(HashMap::new()),
            fail: Mutex::new(HashSet::new()),
            connects: Mutex::new(vec![]),
        })
    }

    pub fn register(&self, transport: Arc<FakeTransport>) {
        self.backends
            .lock()
            .insert(transport.name.clone(), transport);
    }

    pub fn transport(&self, name: &str) -> Option<Arc<FakeTransport>> {
        self.backends.lock().get(name).cloned()
    }

    pub fn connect_count(&self, name: &str) -> usize {
        self.connects.lock().iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        name: &str,
        _spec: &TransportSpec,
        timeout: Duration,
    ) -> Result<Arc<BackendClient>> {
        if self.fail.lock().contains(name) {
            return Err(Error::Transport(format!("refused to launch {name}")));
        }

        let transport = self
            .transport(name)
            .unwrap_or_else(|| FakeTransport::new(name, vec![]));
        self.connects.lock().push(name.to_string());

        let client = BackendClient::with_transport(name, transport, timeout).with_policies(
            ConnectPolicy {
                attempts: 1,
                gap: Duration::from_millis(1),
            },
            RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
            },
        );
        client.connect().await?;
        Ok(Arc::new(client))
    }
}

/// A minimal tool definition in wire form
pub fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object"}
    })
}

/// Write catalog fixtures: three plain servers (a, b, c), one needing auth
/// (git), one needing arguments (files)
pub fn write_catalog_fixtures(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let catalog = dir.join("mcp-registry.json");
    let index = dir.join("enhanced-index.json");

    std::fs::write(
        &catalog,
        r#"{
            "a": {"command": "fake-a", "description": "Greeter"},
            "b": {"command": "fake-b", "description": "Lookup"},
            "c": {"command": "fake-c", "description": "Fetcher"},
            "git": {
                "command": "fake-git",
                "env": {"GIT_TOKEN": ""},
                "description": "Git operations",
                "authRequirements": [{"name": "GIT_TOKEN", "description": "GitHub token"}]
            },
            "files": {
                "command": "fake-files",
                "description": "Filesystem",
                "argumentRequirements": [
                    {"name": "root", "description": "Root directory", "required": true, "example": "/tmp", "position": 0}
                ]
            }
        }"#,
    )
    .unwrap();

    std::fs::write(
        &index,
        r#"{
            "lastUpdated": "2025-06-01T00:00:00Z",
            "totalServers": 3,
            "servers": [
                {
                    "name": "a",
                    "displayName": "Greeter",
                    "aiSummary": "Greets people by name",
                    "aiUseCases": ["say hello"],
                    "toolCount": 1,
                    "toolDescriptions": [{"name": "greet", "description": "Say hello"}],
                    "embedding": []
                },
                {
                    "name": "b",
                    "displayName": "Lookup",
                    "aiSummary": "Looks up records by key",
                    "aiUseCases": ["find records"],
                    "toolCount": 1,
                    "toolDescriptions": [{"name": "lookup", "description": "Find a record"}],
                    "embedding": []
                },
                {
                    "name": "c",
                    "displayName": "Fetcher",
                    "aiSummary": "Fetches remote documents over the network",
                    "aiUseCases": ["fetch urls"],
                    "toolCount": 1,
                    "toolDescriptions": [{"name": "fetch", "description": "Fetch a URL"}],
                    "embedding": []
                }
            ]
        }"#,
    )
    .unwrap();

    (catalog, index)
}
