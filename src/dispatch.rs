//! Request dispatch over the active set
//!
//! Implements the upstream request contract: `list` requests fan out to
//! every live backend in parallel and aggregate; `call`/`get`/`read`
//! requests route by the item-to-backend maps rebuilt on each list. Two
//! built-in tools (`add_new_mcp`, `search_mcps`) are always appended to the
//! aggregated tool list regardless of what is live.
//!
//! Duplicate item names across backends are first-wins in queue order; no
//! deduplication is attempted.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::active_set::ActiveSet;
use crate::adder::Adder;
use crate::client::BackendClient;
use crate::protocol::{Prompt, Resource, ResourceTemplate, Tool, ToolsCallResult};
use crate::registry::Registry;
use crate::{Error, Result};

/// Name of the built-in add tool
pub const ADD_NEW_MCP: &str = "add_new_mcp";
/// Name of the built-in search tool
pub const SEARCH_MCPS: &str = "search_mcps";

/// Per-category item-to-backend maps, rebuilt on each aggregated list
#[derive(Default)]
struct RouteMaps {
    tools: HashMap<String, String>,
    prompts: HashMap<String, String>,
    resources: HashMap<String, String>,
}

/// Routes upstream requests across the live backends
pub struct Dispatcher {
    active: Arc<ActiveSet>,
    registry: Arc<Registry>,
    adder: Adder,
    routes: RwLock<RouteMaps>,
    default_search_limit: usize,
}

impl Dispatcher {
    /// Create a dispatcher over the shared active set and registry
    #[must_use]
    pub fn new(
        active: Arc<ActiveSet>,
        registry: Arc<Registry>,
        default_search_limit: usize,
    ) -> Self {
        let adder = Adder::new(Arc::clone(&registry), Arc::clone(&active));
        Self {
            active,
            registry,
            adder,
            routes: RwLock::new(RouteMaps::default()),
            default_search_limit,
        }
    }

    /// Aggregate `tools/list` across every live backend.
    ///
    /// Tool descriptions are prefixed with `[<backend>]` for human context.
    /// Backends that fail mid-fan-out (including an eviction race) are
    /// omitted with a warning rather than failing the whole list. The two
    /// built-in tools are always appended.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let clients = self.active.ready_clients().await;
        let results = join_all(clients.into_iter().map(|(name, client)| async move {
            let tools = client.list_tools().await;
            (name, tools)
        }))
        .await;

        let mut tools = Vec::new();
        let mut map = HashMap::new();
        for (backend, result) in results {
            match result {
                Ok(list) => {
                    for mut tool in list {
                        let description = tool.description.unwrap_or_default();
                        tool.description = Some(format!("[{backend}] {description}"));
                        map.entry(tool.name.clone())
                            .or_insert_with(|| backend.clone());
                        tools.push(tool);
                    }
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "tools/list failed; omitting backend");
                }
            }
        }

        tools.extend(builtin_tools());
        self.routes.write().tools = map;

        debug!(count = tools.len(), "Aggregated tool list");
        tools
    }

    /// Route a `tools/call`: built-ins locally, everything else by route
    /// map with admit-on-miss recovery through the catalog.
    ///
    /// # Errors
    ///
    /// `UnknownTool` when neither the routes nor the catalog know the name;
    /// backend errors pass through unchanged.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if name == ADD_NEW_MCP {
            return self.handle_add(&arguments).await;
        }
        if name == SEARCH_MCPS {
            return self.handle_search(&arguments).await;
        }

        let target = self.routes.read().tools.get(name).cloned();
        let client = match target {
            Some(server) => match self.active.client_for(&server).await {
                Some(client) => client,
                // Stale route: the target was evicted since the last list
                None => self.recover_tool(name).await?,
            },
            None => self.recover_tool(name).await?,
        };

        client.call_tool(name, arguments).await
    }

    /// Admit the cataloged owner of a tool that has no live route
    async fn recover_tool(&self, tool: &str) -> Result<Arc<BackendClient>> {
        match self.registry.find_server_for_tool(tool).await? {
            Some(server) => {
                debug!(tool = %tool, backend = %server, "Recovering route via admission");
                let client = self.active.admit(&server).await?;
                self.routes
                    .write()
                    .tools
                    .insert(tool.to_string(), server);
                Ok(client)
            }
            None => Err(Error::UnknownTool(tool.to_string())),
        }
    }

    /// Aggregate `prompts/list`; backends without the category are silently
    /// excluded
    pub async fn list_prompts(&self) -> Vec<Prompt> {
        let clients = self.active.ready_clients().await;
        let results = join_all(clients.into_iter().map(|(name, client)| async move {
            let prompts = client.list_prompts().await;
            (name, prompts)
        }))
        .await;

        let mut prompts = Vec::new();
        let mut map = HashMap::new();
        for (backend, result) in results {
            match result {
                Ok(list) => {
                    for prompt in list {
                        map.entry(prompt.name.clone())
                            .or_insert_with(|| backend.clone());
                        prompts.push(prompt);
                    }
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "prompts/list failed; omitting backend");
                }
            }
        }

        self.routes.write().prompts = map;
        prompts
    }

    /// Route a `prompts/get` by prompt name, rebuilding routes once on miss
    ///
    /// # Errors
    ///
    /// `UnknownPrompt` when no live backend serves the name.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<Value> {
        if let Some(client) = self.prompt_client(name).await {
            return client.get_prompt(name, arguments).await;
        }

        self.list_prompts().await;
        match self.prompt_client(name).await {
            Some(client) => client.get_prompt(name, arguments).await,
            None => Err(Error::UnknownPrompt(name.to_string())),
        }
    }

    async fn prompt_client(&self, name: &str) -> Option<Arc<BackendClient>> {
        let server = self.routes.read().prompts.get(name).cloned()?;
        self.active.client_for(&server).await
    }

    /// Aggregate `resources/list`; backends without the category are
    /// silently excluded
    pub async fn list_resources(&self) -> Vec<Resource> {
        let clients = self.active.ready_clients().await;
        let results = join_all(clients.into_iter().map(|(name, client)| async move {
            let resources = client.list_resources().await;
            (name, resources)
        }))
        .await;

        let mut resources = Vec::new();
        let mut map = HashMap::new();
        for (backend, result) in results {
            match result {
                Ok(list) => {
                    for resource in list {
                        map.entry(resource.uri.clone())
                            .or_insert_with(|| backend.clone());
                        resources.push(resource);
                    }
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "resources/list failed; omitting backend");
                }
            }
        }

        self.routes.write().resources = map;
        resources
    }

    /// Aggregate `resources/templates/list`
    pub async fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        let clients = self.active.ready_clients().await;
        let results = join_all(clients.into_iter().map(|(name, client)| async move {
            let templates = client.list_resource_templates().await;
            (name, templates)
        }))
        .await;

        let mut templates = Vec::new();
        for (backend, result) in results {
            match result {
                Ok(list) => templates.extend(list),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "resources/templates/list failed; omitting backend");
                }
            }
        }
        templates
    }

    /// Route a `resources/read` by URI, rebuilding routes once on miss
    ///
    /// # Errors
    ///
    /// `UnknownResource` when no live backend serves the URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        if let Some(client) = self.resource_client(uri).await {
            return client.read_resource(uri).await;
        }

        self.list_resources().await;
        match self.resource_client(uri).await {
            Some(client) => client.read_resource(uri).await,
            None => Err(Error::UnknownResource(uri.to_string())),
        }
    }

    async fn resource_client(&self, uri: &str) -> Option<Arc<BackendClient>> {
        let server = self.routes.read().resources.get(uri).cloned()?;
        self.active.client_for(&server).await
    }

    /// Built-in: `add_new_mcp`
    async fn handle_add(&self, arguments: &Value) -> Result<Value> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::json_rpc(-32602, "Missing 'name' parameter"))?;

        let user_args: HashMap<String, String> = arguments
            .get("arguments")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let outcome = self.adder.add(name, &user_args).await?;

        // A successful add changes the tool list; rebuild routes so the new
        // tools resolve without another list round-trip
        if matches!(outcome, crate::adder::AddOutcome::Added { .. }) {
            self.list_tools().await;
        }

        let text = serde_json::to_string_pretty(&outcome)?;
        Ok(serde_json::to_value(ToolsCallResult::text(text))?)
    }

    /// Built-in: `search_mcps`
    async fn handle_search(&self, arguments: &Value) -> Result<Value> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::json_rpc(-32602, "Missing 'query' parameter"))?;

        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map_or(self.default_search_limit, |l| l as usize);

        let hits = self.registry.search(query, limit).await?;

        let text = if hits.is_empty() {
            "No matching servers found.".to_string()
        } else {
            serde_json::to_string_pretty(&json!({
                "query": query,
                "results": hits,
            }))?
        };

        Ok(serde_json::to_value(ToolsCallResult::text(text))?)
    }
}

/// The two built-in tools appended to every aggregated tool list
#[must_use]
pub fn builtin_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: ADD_NEW_MCP.to_string(),
            title: Some("Add MCP Server".to_string()),
            description: Some(
                "Add a catalogued MCP server to the active set, launching it and \
                 exposing its tools. Returns structured guidance when the server \
                 still needs arguments or credentials."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Catalog name of the server to add"
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Values for the server's declared launch arguments",
                        "additionalProperties": {"type": "string"}
                    }
                },
                "required": ["name"]
            }),
            output_schema: None,
        },
        Tool {
            name: SEARCH_MCPS.to_string(),
            title: Some("Search MCP Servers".to_string()),
            description: Some(
                "Search the catalog of known MCP servers by capability. Returns \
                 the best matches with similarity scores."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What capability you are looking for"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum results (1-10)",
                        "minimum": 1,
                        "maximum": 10,
                        "default": 4
                    }
                },
                "required": ["query"]
            }),
            output_schema: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_always_two() {
        let tools = builtin_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, ADD_NEW_MCP);
        assert_eq!(tools[1].name, SEARCH_MCPS);
    }

    #[test]
    fn add_schema_requires_name() {
        let tools = builtin_tools();
        let add = &tools[0];
        assert_eq!(add.input_schema["required"][0], "name");
        assert!(add.input_schema["properties"]["arguments"].is_object());
    }

    #[test]
    fn search_schema_bounds_limit() {
        let tools = builtin_tools();
        let search = &tools[1];
        assert_eq!(search.input_schema["properties"]["limit"]["minimum"], 1);
        assert_eq!(search.input_schema["properties"]["limit"]["maximum"], 10);
        assert_eq!(search.input_schema["properties"]["limit"]["default"], 4);
    }
}
