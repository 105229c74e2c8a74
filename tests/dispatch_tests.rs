//! Aggregation and routing tests against in-memory backends

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeConnector, FakeTransport, tool, write_catalog_fixtures};
use mcp_proxy_router::active_set::{ActiveSet, ChangeNotifier};
use mcp_proxy_router::config_store::ConfigStore;
use mcp_proxy_router::dispatch::{ADD_NEW_MCP, Dispatcher, SEARCH_MCPS};
use mcp_proxy_router::registry::Registry;
use serde_json::{Value, json};

struct Fixture {
    dispatcher: Dispatcher,
    active: Arc<ActiveSet>,
    connector: Arc<FakeConnector>,
    _dir: tempfile::TempDir,
}

fn fixture(max_live: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let (catalog, index) = write_catalog_fixtures(dir.path());
    let registry = Arc::new(Registry::new(catalog, index, Duration::from_secs(60), None));

    let connector = FakeConnector::new();
    connector.register(FakeTransport::with_prompts(
        "a",
        vec![tool("greet", "Say hello"), tool("shared", "Shared by a")],
        vec![json!({"name": "review", "description": "Review things"})],
    ));
    connector.register(FakeTransport::new(
        "b",
        vec![tool("lookup", "Find a record"), tool("shared", "Shared by b")],
    ));
    connector.register(FakeTransport::new("c", vec![tool("fetch", "Fetch a URL")]));

    let active = Arc::new(ActiveSet::new(
        max_live,
        Duration::from_secs(5),
        Arc::clone(&connector) as Arc<dyn mcp_proxy_router::client::Connector>,
        Arc::clone(&registry),
        ConfigStore::new(dir.path().join("config.json")),
        ChangeNotifier::new(),
    ));

    let dispatcher = Dispatcher::new(Arc::clone(&active), registry, 4);

    Fixture {
        dispatcher,
        active,
        connector,
        _dir: dir,
    }
}

fn result_text(result: &Value) -> &str {
    result["content"][0]["text"].as_str().unwrap()
}

// ===========================================================================
// tools/list aggregation
// ===========================================================================

#[tokio::test]
async fn list_tools_prefixes_descriptions_and_appends_builtins() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();
    f.active.admit("b").await.unwrap();

    let tools = f.dispatcher.list_tools().await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    // Backend tools plus the two built-ins, which are always present
    assert!(names.contains(&"greet"));
    assert!(names.contains(&"lookup"));
    assert!(names.contains(&ADD_NEW_MCP));
    assert!(names.contains(&SEARCH_MCPS));

    let greet = tools.iter().find(|t| t.name == "greet").unwrap();
    assert_eq!(greet.description.as_deref(), Some("[a] Say hello"));
}

#[tokio::test]
async fn builtins_present_with_empty_active_set() {
    let f = fixture(3);
    let tools = f.dispatcher.list_tools().await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec![ADD_NEW_MCP, SEARCH_MCPS]);
}

#[tokio::test]
async fn duplicate_tool_name_routes_first_wins() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();
    f.active.admit("b").await.unwrap();

    f.dispatcher.list_tools().await;

    // "shared" exists on both; queue order is [a, b] so a wins the route
    let result = f
        .dispatcher
        .call_tool("shared", json!({}))
        .await
        .unwrap();
    assert_eq!(result_text(&result), "a::shared");
}

// ===========================================================================
// tools/call routing
// ===========================================================================

#[tokio::test]
async fn call_routes_by_map_and_touches_target() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();
    f.active.admit("b").await.unwrap();
    f.dispatcher.list_tools().await;

    let result = f.dispatcher.call_tool("greet", json!({"who": "x"})).await.unwrap();
    assert_eq!(result_text(&result), "a::greet");

    // Touch-on-use moved a to the hot end
    assert_eq!(
        f.active.names().await,
        vec!["b".to_string(), "a".to_string()]
    );
}

#[tokio::test]
async fn call_recovers_unrouted_tool_through_catalog_admission() {
    let f = fixture(2);
    f.active.admit("a").await.unwrap();

    // "fetch" has no route and its owner "c" is not live; the catalog's
    // tool metadata recovers it
    let result = f.dispatcher.call_tool("fetch", json!({"u": "z"})).await.unwrap();
    assert_eq!(result_text(&result), "c::fetch");
    assert!(f.active.is_active("c").await);
    assert_eq!(f.connector.connect_count("c"), 1);
}

#[tokio::test]
async fn call_recovers_stale_route_after_eviction() {
    let f = fixture(2);
    f.active.admit("a").await.unwrap();
    f.dispatcher.list_tools().await;

    // Evicting "a" leaves the greet route stale
    f.active.evict("a").await.unwrap();

    let result = f.dispatcher.call_tool("greet", json!({})).await.unwrap();
    assert_eq!(result_text(&result), "a::greet");
    assert_eq!(f.connector.connect_count("a"), 2);
}

#[tokio::test]
async fn call_unknown_tool_is_method_not_found() {
    let f = fixture(2);
    let err = f.dispatcher.call_tool("no_such_tool", json!({})).await.unwrap_err();
    assert_eq!(err.to_rpc_code(), -32601);
}

// ===========================================================================
// prompts and resources
// ===========================================================================

#[tokio::test]
async fn prompts_aggregation_excludes_unsupporting_backends() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();
    f.active.admit("b").await.unwrap();

    // b answers -32601 for prompts but still serves tools
    let prompts = f.dispatcher.list_prompts().await;
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].name, "review");

    let tools = f.dispatcher.list_tools().await;
    assert!(tools.iter().any(|t| t.name == "lookup"));
}

#[tokio::test]
async fn get_prompt_routes_after_list_rebuild() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();

    // No prompts/list has run yet; get_prompt rebuilds routes itself
    let result = f.dispatcher.get_prompt("review", None).await.unwrap();
    assert_eq!(result["description"], "a::review");
}

#[tokio::test]
async fn get_unknown_prompt_fails() {
    let f = fixture(3);
    f.active.admit("a").await.unwrap();
    let err = f.dispatcher.get_prompt("nope", None).await.unwrap_err();
    assert_eq!(err.to_rpc_code(), -32601);
}

// ===========================================================================
// Built-in: search_mcps
// ===========================================================================

#[tokio::test]
async fn search_mcps_returns_ranked_results() {
    let f = fixture(2);

    let result = f
        .dispatcher
        .call_tool(SEARCH_MCPS, json!({"query": "fetches remote documents", "limit": 3}))
        .await
        .unwrap();

    let text = result_text(&result);
    assert!(text.contains("\"query\""));
    assert!(text.contains("Fetcher"));
    // Search never mutates the active set
    assert!(f.active.names().await.is_empty());
}

#[tokio::test]
async fn search_mcps_requires_query() {
    let f = fixture(2);
    let err = f.dispatcher.call_tool(SEARCH_MCPS, json!({})).await.unwrap_err();
    assert_eq!(err.to_rpc_code(), -32602);
}

// ===========================================================================
// Built-in: add_new_mcp
// ===========================================================================

#[tokio::test]
async fn add_new_mcp_launches_and_reports_tools() {
    let f = fixture(2);

    let result = f
        .dispatcher
        .call_tool(ADD_NEW_MCP, json!({"name": "c"}))
        .await
        .unwrap();

    let text = result_text(&result);
    assert!(text.contains("\"status\": \"added\""));
    assert!(text.contains("fetch"));
    assert!(f.active.is_active("c").await);

    // The refreshed route map resolves the new tool directly
    let call = f.dispatcher.call_tool("fetch", json!({})).await.unwrap();
    assert_eq!(result_text(&call), "c::fetch");
}

#[tokio::test]
async fn add_new_mcp_unknown_server_lists_candidates() {
    let f = fixture(2);

    let result = f
        .dispatcher
        .call_tool(ADD_NEW_MCP, json!({"name": "ghost"}))
        .await
        .unwrap();

    let text = result_text(&result);
    assert!(text.contains("\"status\": \"unknown-server\""));
    assert!(text.contains("\"a\""));
    assert!(f.active.names().await.is_empty());
}

#[tokio::test]
async fn add_new_mcp_needs_auth_makes_no_change() {
    let f = fixture(2);
    if std::env::var("GIT_TOKEN").is_ok() {
        return;
    }

    let result = f
        .dispatcher
        .call_tool(ADD_NEW_MCP, json!({"name": "git"}))
        .await
        .unwrap();

    let text = result_text(&result);
    assert!(text.contains("\"status\": \"needs-auth\""));
    assert!(text.contains("GIT_TOKEN"));
    assert!(f.active.names().await.is_empty());
}

#[tokio::test]
async fn add_new_mcp_needs_arguments_reports_requests() {
    let f = fixture(2);

    let result = f
        .dispatcher
        .call_tool(ADD_NEW_MCP, json!({"name": "files"}))
        .await
        .unwrap();

    let text = result_text(&result);
    assert!(text.contains("\"status\": \"needs-arguments\""));
    assert!(text.contains("\"root\""));
    assert!(f.active.names().await.is_empty());
}

#[tokio::test]
async fn add_new_mcp_already_active_touches() {
    let f = fixture(2);
    f.active.admit("a").await.unwrap();
    f.active.admit("b").await.unwrap();

    let result = f
        .dispatcher
        .call_tool(ADD_NEW_MCP, json!({"name": "a"}))
        .await
        .unwrap();

    assert!(result_text(&result).contains("\"status\": \"already-active\""));
    assert_eq!(
        f.active.names().await,
        vec!["b".to_string(), "a".to_string()]
    );
    assert_eq!(f.connector.connect_count("a"), 1);
}
