//! HTTP router and handlers for the upstream endpoint

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    routing::post,
};
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::auth::{AuthGate, auth_middleware};
use super::session::{DisconnectGuard, SessionManager};
use crate::active_set::ActiveSet;
use crate::dispatch::Dispatcher;
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, PromptsGetParams, PromptsListResult, RequestId,
    ResourcesListResult, ResourcesReadParams, ResourcesTemplatesListResult, ServerCapabilities,
    ToolsCapability, ToolsListResult, negotiate_version,
};

/// Shared application state
pub struct AppState {
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Singleton session holder
    pub sessions: Arc<SessionManager>,
    /// Live backend set (health reporting)
    pub active: Arc<ActiveSet>,
    /// Auth gate
    pub auth: Arc<AuthGate>,
    /// Keep-alive interval for the event stream
    pub keep_alive: Duration,
    /// Advertised resource URL
    pub resource_url: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = Arc::clone(&state.auth);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_sse_handler)
                .delete(mcp_delete_handler),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(resource_metadata_handler),
        )
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /mcp - all client-to-server JSON-RPC messages
#[allow(clippy::too_many_lines)]
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
) -> impl IntoResponse {
    let body_bytes = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "jsonrpc": "2.0",
                    "error": {"code": -32700, "message": format!("Failed to read body: {e}")},
                    "id": null
                })),
            )
                .into_response();
        }
    };

    let body: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "jsonrpc": "2.0",
                    "error": {"code": -32700, "message": format!("Invalid JSON: {e}")},
                    "id": null
                })),
            )
                .into_response();
        }
    };

    let (id, method, params) = match parse_request(&body) {
        Ok(parsed) => parsed,
        Err(response) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(response).unwrap()),
            )
                .into_response();
        }
    };

    debug!(method = %method, "Upstream request");

    // Notifications get 202 Accepted and no body
    if method.starts_with("notifications/") {
        return with_session_header(
            &state,
            StatusCode::ACCEPTED,
            Json(json!({})).into_response(),
        );
    }

    // For requests, id is guaranteed to exist (checked in parse_request)
    let id = id.expect("id should exist for non-notification requests");

    // initialize resets any existing session before creating a fresh one
    if method == "initialize" {
        let session = state.sessions.initialize();
        let response = handle_initialize(id, params.as_ref());
        let mut resp = Json(serde_json::to_value(response).unwrap()).into_response();
        if let Ok(v) = session.id.parse() {
            resp.headers_mut().insert("mcp-session-id", v);
        }
        return (StatusCode::OK, resp).into_response();
    }

    // Everything else is routed to the live session
    if state.sessions.current().is_none() {
        let response = JsonRpcResponse::error(
            Some(id),
            -32002,
            "No live session; send initialize first",
        );
        return (StatusCode::OK, Json(serde_json::to_value(response).unwrap())).into_response();
    }

    let response = match method.as_str() {
        "ping" => JsonRpcResponse::success(id, json!({})),

        "tools/list" => {
            let tools = state.dispatcher.list_tools().await;
            let result = ToolsListResult {
                tools,
                next_cursor: None,
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap())
        }

        "tools/call" => {
            let (name, arguments) = extract_tools_call_params(params.as_ref());
            if name.is_empty() {
                JsonRpcResponse::error(Some(id), -32602, "Missing 'name' parameter")
            } else {
                match state.dispatcher.call_tool(name, arguments).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "tools/call failed");
                        JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string())
                    }
                }
            }
        }

        "prompts/list" => {
            let prompts = state.dispatcher.list_prompts().await;
            let result = PromptsListResult {
                prompts,
                next_cursor: None,
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap())
        }

        "prompts/get" => match params
            .map(serde_json::from_value::<PromptsGetParams>)
            .transpose()
        {
            Ok(Some(p)) => match state.dispatcher.get_prompt(&p.name, p.arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
            },
            _ => JsonRpcResponse::error(Some(id), -32602, "Invalid prompts/get params"),
        },

        "resources/list" => {
            let resources = state.dispatcher.list_resources().await;
            let result = ResourcesListResult {
                resources,
                next_cursor: None,
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap())
        }

        "resources/read" => match params
            .map(serde_json::from_value::<ResourcesReadParams>)
            .transpose()
        {
            Ok(Some(p)) => match state.dispatcher.read_resource(&p.uri).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
            },
            _ => JsonRpcResponse::error(Some(id), -32602, "Invalid resources/read params"),
        },

        "resources/templates/list" => {
            let templates = state.dispatcher.list_resource_templates().await;
            let result = ResourcesTemplatesListResult {
                resource_templates: templates,
                next_cursor: None,
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap())
        }

        _ => JsonRpcResponse::error(Some(id), -32601, format!("Method not found: {method}")),
    };

    with_session_header(
        &state,
        StatusCode::OK,
        Json(serde_json::to_value(response).unwrap()).into_response(),
    )
}

/// Build the initialize result with version negotiation
fn handle_initialize(id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
    let client_version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or("2024-11-05");
    let negotiated = negotiate_version(client_version);
    debug!(client = client_version, negotiated, "Protocol version negotiation");

    let result = InitializeResult {
        protocol_version: negotiated.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            ..Default::default()
        },
        server_info: Info {
            name: "mcp-proxy-router".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("MCP Proxy Router".to_string()),
            description: Some(
                "Aggregating MCP proxy over a bounded set of live backend servers".to_string(),
            ),
        },
        instructions: Some(
            "Tools from live backend servers appear directly in tools/list. \
             Use search_mcps to discover more servers in the catalog and \
             add_new_mcp to attach one; the tool list updates after every \
             change (watch for tools/list_changed)."
                .to_string(),
        ),
    };

    JsonRpcResponse::success(id, serde_json::to_value(result).unwrap())
}

/// GET /mcp - the server-to-client event stream
async fn mcp_sse_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({
                "error": "Must accept text/event-stream for the notification stream"
            })),
        )
            .into_response();
    }

    let Some(session) = state.sessions.current() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32002, "message": "No live session; send initialize first"},
                "id": null
            })),
        )
            .into_response();
    };

    info!(session_id = %session.id, "Client connected to event stream");

    let rx = session.subscribe();
    let guard = DisconnectGuard::new(Arc::clone(&state.sessions), session.id.clone());
    let sse = Sse::new(notification_stream(rx, guard)).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("keep-alive"),
    );

    let mut response = sse.into_response();
    if let Ok(v) = session.id.parse() {
        response.headers_mut().insert("mcp-session-id", v);
    }
    response
}

/// Turn the session's notification channel into an SSE stream.
///
/// The guard travels inside the generator so dropping the stream (client
/// disconnect) reaches the session manager.
fn notification_stream(
    mut rx: broadcast::Receiver<Value>,
    guard: DisconnectGuard,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    yield Ok(Event::default()
                        .event("message")
                        .data(payload.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Drop-oldest is fine: the client re-lists on any
                    // tools/list_changed it does see
                    debug!(missed, "Notification stream lagged");
                }
            }
        }
    }
}

/// DELETE /mcp - explicit session teardown
async fn mcp_delete_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.sessions.clear() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// GET /health - liveness probe
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let transport_active = state.active.any_connected().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "transport_active": transport_active,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// GET /.well-known/oauth-protected-resource - bearer-token discovery
async fn resource_metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "resource": state.resource_url,
        "authorization_servers": [],
        "bearer_methods_supported": ["header"],
    }))
}

/// Attach the live session id header to a response
fn with_session_header(
    state: &AppState,
    status: StatusCode,
    mut response: axum::response::Response,
) -> axum::response::Response {
    if let Some(session) = state.sessions.current() {
        if let Ok(v) = session.id.parse() {
            response.headers_mut().insert("mcp-session-id", v);
        }
    }
    (status, response).into_response()
}

/// Extract a `RequestId` from a JSON value.
///
/// Supports string and integer ID values per JSON-RPC 2.0 spec.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    if let Some(s) = value.as_str() {
        Some(RequestId::String(s.to_string()))
    } else if let Some(n) = value.as_i64() {
        Some(RequestId::Number(n))
    } else {
        value.as_u64().map(|n| {
            #[allow(clippy::cast_possible_wrap)]
            RequestId::Number(n as i64)
        })
    }
}

/// Check whether a method name represents a notification (no response expected)
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Extract the `tools/call` parameters (tool name and arguments)
fn extract_tools_call_params(params: Option<&Value>) -> (&str, Value) {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or(json!({}));
    (name, arguments)
}

/// Parse JSON-RPC request or notification.
/// Returns (id, method, params) - id is `None` for notifications.
#[allow(clippy::result_large_err)] // JsonRpcResponse used directly as HTTP error body
fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            -32600,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), -32600, "Missing method"))?;

    let params = value.get("params").cloned();

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(None, -32600, "Missing id"));
    }

    Ok((id, method.to_string(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // =====================================================================
    // extract_request_id
    // =====================================================================

    #[test]
    fn extract_request_id_string_value() {
        let val = json!("abc-123");
        let id = extract_request_id(&val).unwrap();
        assert_eq!(id, RequestId::String("abc-123".to_string()));
    }

    #[test]
    fn extract_request_id_positive_integer() {
        let val = json!(42);
        assert_eq!(extract_request_id(&val).unwrap(), RequestId::Number(42));
    }

    #[test]
    fn extract_request_id_negative_integer() {
        let val = json!(-1);
        assert_eq!(extract_request_id(&val).unwrap(), RequestId::Number(-1));
    }

    #[test]
    fn extract_request_id_rejects_non_id_types() {
        assert!(extract_request_id(&json!(null)).is_none());
        assert!(extract_request_id(&json!(true)).is_none());
        assert!(extract_request_id(&json!(3.15)).is_none());
        assert!(extract_request_id(&json!([1])).is_none());
        assert!(extract_request_id(&json!({"id": 1})).is_none());
    }

    // =====================================================================
    // is_notification_method
    // =====================================================================

    #[test]
    fn notification_method_recognized() {
        assert!(is_notification_method("notifications/initialized"));
        assert!(is_notification_method("notifications/cancelled"));
    }

    #[test]
    fn regular_method_not_notification() {
        assert!(!is_notification_method("initialize"));
        assert!(!is_notification_method("tools/list"));
        assert!(!is_notification_method("ping"));
        assert!(!is_notification_method(""));
    }

    // =====================================================================
    // extract_tools_call_params
    // =====================================================================

    #[test]
    fn extract_tools_call_params_full() {
        let params = json!({"name": "my_tool", "arguments": {"key": "value"}});
        let (name, args) = extract_tools_call_params(Some(&params));
        assert_eq!(name, "my_tool");
        assert_eq!(args, json!({"key": "value"}));
    }

    #[test]
    fn extract_tools_call_params_missing_pieces() {
        let params = json!({"arguments": {"key": "value"}});
        let (name, args) = extract_tools_call_params(Some(&params));
        assert_eq!(name, "");
        assert_eq!(args, json!({"key": "value"}));

        let (name, args) = extract_tools_call_params(None);
        assert_eq!(name, "");
        assert_eq!(args, json!({}));
    }

    // =====================================================================
    // parse_request
    // =====================================================================

    #[test]
    fn parse_request_valid_with_string_id() {
        let req = json!({"jsonrpc": "2.0", "id": "req-1", "method": "tools/list"});
        let (id, method, params) = parse_request(&req).unwrap();
        assert_eq!(id, Some(RequestId::String("req-1".to_string())));
        assert_eq!(method, "tools/list");
        assert!(params.is_none());
    }

    #[test]
    fn parse_request_notification_without_id() {
        let req = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let (id, method, _params) = parse_request(&req).unwrap();
        assert!(id.is_none());
        assert_eq!(method, "notifications/initialized");
    }

    #[test]
    fn parse_request_missing_jsonrpc_field() {
        let req = json!({"id": 1, "method": "ping"});
        let err = parse_request(&req).unwrap_err();
        assert_eq!(err.error.as_ref().unwrap().code, -32600);
    }

    #[test]
    fn parse_request_missing_method() {
        let req = json!({"jsonrpc": "2.0", "id": 1});
        let err = parse_request(&req).unwrap_err();
        assert!(err.error.as_ref().unwrap().message.contains("method"));
    }

    #[test]
    fn parse_request_non_notification_without_id() {
        let req = json!({"jsonrpc": "2.0", "method": "tools/list"});
        let err = parse_request(&req).unwrap_err();
        assert!(err.error.as_ref().unwrap().message.contains("id"));
    }

    // =====================================================================
    // handle_initialize
    // =====================================================================

    #[test]
    fn initialize_negotiates_version_and_advertises_list_changed() {
        let response = handle_initialize(
            RequestId::Number(1),
            Some(&json!({"protocolVersion": "2024-11-05"})),
        );
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["serverInfo"]["name"], "mcp-proxy-router");
    }

    #[test]
    fn initialize_defaults_unknown_version_to_latest() {
        let response = handle_initialize(
            RequestId::Number(1),
            Some(&json!({"protocolVersion": "1990-01-01"})),
        );
        let result = response.result.unwrap();
        assert_eq!(
            result["protocolVersion"],
            crate::protocol::PROTOCOL_VERSION
        );
    }
}
