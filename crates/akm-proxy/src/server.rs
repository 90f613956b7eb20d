//! Server assembly: router, CORS, admin-token guard, and startup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api;
use crate::proxy::proxy_handler;
use crate::state::AppState;

/// Server configuration, populated from the environment by the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8765,
            cors_origins: default_cors_origins(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Read configuration from `AKM_BIND`, `AKM_PORT`, `AKM_CORS_ORIGINS`,
    /// and `AKM_API_KEY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("AKM_BIND").unwrap_or(defaults.bind_addr),
            port: std::env::var("AKM_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: cors_origins_from_env(),
            admin_token: std::env::var("AKM_API_KEY").ok().filter(|t| !t.is_empty()),
        }
    }

    /// The `host:port` string this server binds to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn default_cors_origins() -> Vec<String> {
    [
        "http://localhost:5173",
        "http://127.0.0.1:5173",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn cors_origins_from_env() -> Vec<String> {
    let raw = std::env::var("AKM_CORS_ORIGINS").unwrap_or_default();
    if raw.trim().is_empty() {
        return default_cors_origins();
    }
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if origins.is_empty() {
        vec!["*".to_string()]
    } else {
        origins
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

// ---------------------------------------------------------------------------
// Admin token guard
// ---------------------------------------------------------------------------

/// Reject requests without the configured admin token.
///
/// Disabled when no token is configured.  OPTIONS preflights and the health
/// endpoint are always allowed through.
async fn admin_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(request).await;
    };

    if request.method() == Method::OPTIONS || request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    let presented = bearer_token(&request)
        .or_else(|| header_value(&request, "x-api-key"))
        .or_else(|| header_value(&request, "api-key"));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response(),
    }
}

fn header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(request: &Request) -> Option<&str> {
    let value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Router and startup
// ---------------------------------------------------------------------------

/// Build the full router: admin API plus the OpenAI-compatible proxy
/// surface.
pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    // Proxy routes are declared with their full paths: the forwarded URI
    // must keep the /v1 prefix the upstream expects.
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/keys", get(api::list_keys).post(api::add_key))
        .route("/api/keys/{name}", get(api::get_key).delete(api::delete_key))
        .route("/api/export/env", post(api::export_env))
        .route("/api/budget", get(api::budget_stats))
        .route("/api/verify", post(api::verify_keys))
        .route("/v1/chat/completions", any(proxy_handler))
        .route("/v1/completions", any(proxy_handler))
        .route("/v1/embeddings", any(proxy_handler))
        .route("/v1/models", any(proxy_handler))
        .route("/v1/models/{*path}", any(proxy_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_guard,
        ))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Bind and serve until shut down.
pub async fn serve(
    config: ServerConfig,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = config.addr();
    let app = router(state, &config.cors_origins);

    tracing::info!(addr = %addr, "starting akm server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:8765");
        assert!(config.admin_token.is_none());
        assert_eq!(config.cors_origins.len(), 4);
    }

    #[test]
    fn bearer_token_extraction() {
        let request = Request::builder()
            .header("authorization", "Bearer tok-123")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request), Some("tok-123"));

        let request = Request::builder()
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request), None);
    }
}
