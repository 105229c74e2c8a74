//! Bearer-token gate for the upstream endpoint
//!
//! Every route except `/health` and `/.well-known/*` requires an
//! `Authorization: Bearer` header. Validation is a presence check unless an
//! expected token is configured. Failures answer HTTP 401 with a
//! `WWW-Authenticate` challenge pointing at the resource-metadata URL and a
//! JSON-RPC `-32001` body.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::rpc_codes;

/// Resolved auth configuration
#[derive(Debug, Clone)]
pub struct AuthGate {
    /// Whether the gate is enabled
    pub enabled: bool,
    /// Expected token; `None` accepts any non-empty bearer
    pub bearer_token: Option<String>,
    /// Advertised in the `WWW-Authenticate` challenge
    pub resource_metadata_url: String,
}

impl AuthGate {
    /// Build the gate from settings
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.server.auth_enabled,
            bearer_token: settings.server.bearer_token.clone(),
            resource_metadata_url: settings.resource_metadata_url(),
        }
    }

    /// Whether a path bypasses the gate
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        path.starts_with("/health") || path.starts_with("/.well-known/")
    }

    /// Validate a bearer token value
    #[must_use]
    pub fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        match &self.bearer_token {
            Some(expected) => token == expected,
            None => true,
        }
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !gate.enabled {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if gate.is_public_path(path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    match token {
        Some(token) if gate.validate(token) => next.run(request).await,
        Some(_) => {
            warn!(path = %path, "Invalid token");
            unauthorized_response(&gate, "Invalid token")
        }
        None => {
            warn!(path = %path, "Missing Authorization header");
            unauthorized_response(
                &gate,
                "Missing Authorization header. Use: Authorization: Bearer <token>",
            )
        }
    }
}

/// Create a 401 Unauthorized response with the metadata challenge
fn unauthorized_response(gate: &AuthGate, message: &str) -> Response {
    let challenge = format!(
        "Bearer resource_metadata=\"{}\"",
        gate.resource_metadata_url
    );
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", challenge)],
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": rpc_codes::UNAUTHORIZED,
                "message": message
            },
            "id": null
        })),
    )
        .into_response()
}
