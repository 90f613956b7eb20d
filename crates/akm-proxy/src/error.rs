//! Proxy error types and their HTTP mapping.
//!
//! Every failure a proxied request can hit maps to the JSON error body the
//! upstream-compatible clients expect: `{"error": {"message", "type"}}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use akm_budget::BudgetError;
use akm_vault::VaultError;

/// Unified error type for the proxy crate.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Neither an override header nor a recognizable model name identified
    /// the target provider.  Nothing was forwarded.
    #[error(
        "cannot determine provider: set the X-AKM-Provider header or use a \
         recognizable model name"
    )]
    UnresolvedProvider,

    /// The named provider has no route configured.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The request itself was malformed (unreadable body, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No usable key for the resolved provider.
    #[error("no active key found for provider '{0}'")]
    NoActiveKey(String),

    /// An explicitly requested key could not be read or decrypted.
    #[error("key '{name}' not found or failed to decrypt: {reason}")]
    KeyUnavailable { name: String, reason: String },

    /// Budget check failed — rejected before any network I/O.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// Vault-level failure while serving the request.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// The single outbound call to the provider failed.  Surfaced verbatim,
    /// no retry.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ProxyError {
    /// HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnresolvedProvider | Self::UnknownProvider(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Budget(BudgetError::Exceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Budget(_) | Self::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoActiveKey(_) | Self::KeyUnavailable { .. } | Self::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// The machine-readable error type in the JSON body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnresolvedProvider | Self::UnknownProvider(_) | Self::InvalidRequest(_) => {
                "invalid_request_error"
            }
            Self::Budget(BudgetError::Exceeded { .. }) => "budget_exceeded",
            Self::Budget(_) | Self::Vault(_) => "server_error",
            Self::NoActiveKey(_) | Self::KeyUnavailable { .. } => "key_error",
            Self::Upstream(_) => "upstream_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        tracing::debug!(status = %status, error = %self, "rejecting proxied request");
        (status, Json(body)).into_response()
    }
}

/// Convenience alias used throughout the proxy crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
