//! The reverse-proxy handler.
//!
//! Per inbound request: buffer the body, resolve the provider, check the
//! budget, select a key, forward exactly once with the provider's auth
//! injected, and record usage only after an upstream response arrives — a
//! failed call must not consume quota.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Response;

use akm_vault::KeyStore;

use crate::error::{ProxyError, Result};
use crate::providers::ProviderRoute;
use crate::state::AppState;

/// Header naming an explicit provider override.  Consumed and stripped.
pub const PROVIDER_HEADER: &str = "x-akm-provider";

/// Header naming an explicit key to use.  Consumed and stripped.
pub const KEY_HEADER: &str = "x-akm-key";

/// Maximum buffered request body size (16 MB).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Hop-by-hop headers that must not be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle one `/v1/*` request end to end.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response> {
    let (parts, body) = request.into_parts();

    // The body is needed twice: for provider inference and for forwarding.
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

    let provider_header = parts
        .headers
        .get(PROVIDER_HEADER)
        .and_then(|v| v.to_str().ok());
    let provider = state.providers.resolve(provider_header, &body)?;
    let route = state
        .providers
        .route(&provider)
        .ok_or_else(|| ProxyError::UnknownProvider(provider.clone()))?;

    // Reject over-quota requests before any network I/O.
    state.budget.check(&provider)?;

    let key_header = parts.headers.get(KEY_HEADER).and_then(|v| v.to_str().ok());
    let (key_name, api_key) = select_key(&state.store, &provider, key_header)?;

    let upstream = build_upstream_request(&state.http, route, &parts, &body, &api_key)?;

    tracing::debug!(
        provider,
        key = %key_name,
        path = parts.uri.path(),
        "forwarding request upstream"
    );

    let response = state.http.execute(upstream).await?;

    // Usage is recorded only once a response was received.
    state.budget.record(&provider);
    state.store.record_proxy_use(&key_name, "proxy");

    relay_response(response).await
}

/// Pick the key for a proxied request.
///
/// An explicit key-name header takes priority and must decrypt successfully;
/// otherwise the first active key bound to the provider is used.
fn select_key(
    store: &KeyStore,
    provider: &str,
    key_name: Option<&str>,
) -> Result<(String, String)> {
    if let Some(name) = key_name.map(str::trim).filter(|n| !n.is_empty()) {
        let value = store
            .get_value(name, "proxy")
            .map_err(|e| ProxyError::KeyUnavailable {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        return Ok((name.to_string(), value));
    }

    for record in store.list_keys(Some(provider)) {
        if !record.is_active {
            continue;
        }
        match store.get_value(&record.name, "proxy") {
            Ok(value) => return Ok((record.name, value)),
            Err(e) => {
                tracing::warn!(key = %record.name, error = %e, "skipping undecryptable key");
            }
        }
    }

    Err(ProxyError::NoActiveKey(provider.to_string()))
}

/// Build the single outbound request: scheme/host rewritten to the
/// provider's upstream, auth injected, internal and hop-by-hop headers
/// stripped, everything else passed through unmodified.
fn build_upstream_request(
    client: &reqwest::Client,
    route: &ProviderRoute,
    parts: &axum::http::request::Parts,
    body: &[u8],
    api_key: &str,
) -> Result<reqwest::Request> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = url::Url::parse(&format!(
        "{}{}",
        route.base_url.trim_end_matches('/'),
        path_and_query
    ))
    .map_err(|e| ProxyError::InvalidRequest(format!("invalid upstream URL: {e}")))?;

    let mut headers = parts.headers.clone();
    headers.remove(PROVIDER_HEADER);
    headers.remove(KEY_HEADER);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    let auth_name = HeaderName::from_bytes(route.auth_header.as_bytes())
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid auth header name: {e}")))?;

    // The caller's own Authorization is replaced by the stored key — drop it
    // unless the provider's auth header is itself named Authorization (in
    // which case the insert below overwrites it).
    if auth_name != header::AUTHORIZATION {
        headers.remove(header::AUTHORIZATION);
    }

    let auth_value = HeaderValue::from_str(&format!("{}{}", route.auth_prefix, api_key))
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid auth header value: {e}")))?;
    headers.insert(auth_name, auth_value);

    for (name, value) in &route.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid extra header: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid extra header: {e}")))?;
        headers.insert(name, value);
    }

    client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body.to_vec())
        .build()
        .map_err(ProxyError::Upstream)
}

/// Relay the upstream response back to the caller unmodified, minus
/// hop-by-hop headers.
async fn relay_response(response: reqwest::Response) -> Result<Response> {
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.bytes().await?;

    let mut builder = Response::builder().status(status);
    if let Some(out_headers) = builder.headers_mut() {
        copy_response_headers(&headers, out_headers);
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to build response: {e}")))
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        let skip = HOP_BY_HOP.iter().any(|h| name.as_str() == *h)
            || *name == header::CONTENT_LENGTH;
        if !skip {
            to.append(name.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderTable;
    use axum::http::Method;

    fn parts_with(
        headers: &[(&str, &str)],
        path: &str,
    ) -> axum::http::request::Parts {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap().into_parts().0
    }

    #[test]
    fn anthropic_auth_injection_replaces_authorization() {
        let table = ProviderTable::builtin();
        let route = table.route("anthropic").unwrap();
        let client = reqwest::Client::new();
        let parts = parts_with(
            &[
                ("authorization", "Bearer caller-token"),
                ("x-akm-provider", "anthropic"),
                ("x-akm-key", "SOME_KEY"),
                ("content-type", "application/json"),
            ],
            "/v1/messages",
        );

        let request =
            build_upstream_request(&client, route, &parts, b"{}", "sk-ant-secret").unwrap();

        let headers = request.headers();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-secret");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert!(headers.get("authorization").is_none());
        assert!(headers.get(PROVIDER_HEADER).is_none());
        assert!(headers.get(KEY_HEADER).is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(request.url().as_str(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn openai_auth_overwrites_existing_authorization() {
        let table = ProviderTable::builtin();
        let route = table.route("openai").unwrap();
        let client = reqwest::Client::new();
        let parts = parts_with(
            &[("authorization", "Bearer caller-token")],
            "/v1/chat/completions?stream=false",
        );

        let request = build_upstream_request(&client, route, &parts, b"{}", "sk-real").unwrap();

        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer sk-real"
        );
        assert_eq!(
            request.url().as_str(),
            "https://api.openai.com/v1/chat/completions?stream=false"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let table = ProviderTable::builtin();
        let route = table.route("openai").unwrap();
        let client = reqwest::Client::new();
        let parts = parts_with(
            &[
                ("connection", "keep-alive"),
                ("transfer-encoding", "chunked"),
                ("x-custom-passthrough", "kept"),
            ],
            "/v1/models",
        );

        let request = build_upstream_request(&client, route, &parts, b"", "sk").unwrap();

        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get("transfer-encoding").is_none());
        assert_eq!(request.headers().get("x-custom-passthrough").unwrap(), "kept");
    }

    #[test]
    fn method_and_body_pass_through() {
        let table = ProviderTable::builtin();
        let route = table.route("openai").unwrap();
        let client = reqwest::Client::new();

        let mut builder = Request::builder().method(Method::DELETE).uri("/v1/models/ft-1");
        builder = builder.header("content-type", "application/json");
        let parts = builder.body(Body::empty()).unwrap().into_parts().0;

        let request =
            build_upstream_request(&client, route, &parts, br#"{"a":1}"#, "sk").unwrap();

        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(
            request.body().and_then(|b| b.as_bytes()),
            Some(br#"{"a":1}"#.as_slice())
        );
    }
}
