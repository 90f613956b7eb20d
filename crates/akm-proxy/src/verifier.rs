//! Concurrent key verification.
//!
//! Each selected key is probed against a minimal authenticated endpoint of
//! its provider.  Probes run concurrently under a fixed worker ceiling, the
//! full batch completes before results are returned, and result ordering
//! matches the input key ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;

use akm_vault::{ApiKeyRecord, KeyStore};

/// Maximum concurrent outbound probes.
pub const MAX_CONCURRENT_PROBES: usize = 5;

/// Per-probe network timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome classification for one probed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// The provider accepted the key (HTTP 200).
    Valid,
    /// The provider rejected the key (HTTP 401/403).
    Invalid,
    /// Network failure, unexpected HTTP status, or decryption failure.
    Error,
    /// No probe endpoint is known for the provider.
    Unsupported,
}

/// The result of verifying a single key.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub name: String,
    pub provider: String,
    pub status: KeyStatus,
    pub message: String,
}

/// A minimal authenticated endpoint used to probe one provider.
#[derive(Debug, Clone)]
pub struct ProbeEndpoint {
    pub url: String,
    pub auth_header: String,
    pub auth_prefix: String,
    pub extra_headers: Vec<(String, String)>,
}

impl ProbeEndpoint {
    fn new(url: &str, auth_header: &str, auth_prefix: &str) -> Self {
        Self {
            url: url.to_string(),
            auth_header: auth_header.to_string(),
            auth_prefix: auth_prefix.to_string(),
            extra_headers: Vec::new(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Builtin probe endpoints per provider.
fn builtin_endpoints() -> HashMap<String, ProbeEndpoint> {
    let mut endpoints = HashMap::new();
    endpoints.insert(
        "openai".to_string(),
        ProbeEndpoint::new("https://api.openai.com/v1/models", "Authorization", "Bearer "),
    );
    endpoints.insert(
        "anthropic".to_string(),
        ProbeEndpoint::new("https://api.anthropic.com/v1/models", "x-api-key", "")
            .with_header("anthropic-version", "2023-06-01"),
    );
    endpoints.insert(
        "gemini".to_string(),
        ProbeEndpoint::new(
            "https://generativelanguage.googleapis.com/v1beta/models",
            "x-goog-api-key",
            "",
        ),
    );
    endpoints.insert(
        "deepseek".to_string(),
        ProbeEndpoint::new("https://api.deepseek.com/models", "Authorization", "Bearer "),
    );
    endpoints.insert(
        "zhipu".to_string(),
        ProbeEndpoint::new(
            "https://open.bigmodel.cn/api/paas/v4/models",
            "Authorization",
            "Bearer ",
        ),
    );
    endpoints
}

/// Canonical provider name, resolving known aliases.
fn canonical_provider(provider: &str) -> String {
    let lowered = provider.to_lowercase();
    match lowered.as_str() {
        "google" => "gemini".to_string(),
        _ => lowered,
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Probes stored keys against their providers.
pub struct Verifier {
    store: Arc<KeyStore>,
    client: reqwest::Client,
    endpoints: HashMap<String, ProbeEndpoint>,
}

impl Verifier {
    /// A verifier with the builtin probe endpoints.
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self::with_endpoints(store, builtin_endpoints())
    }

    /// A verifier with a custom endpoint table.
    pub fn with_endpoints(
        store: Arc<KeyStore>,
        endpoints: HashMap<String, ProbeEndpoint>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            store,
            client,
            endpoints,
        }
    }

    /// Verify the selected keys, optionally filtered by provider and/or
    /// exact name.  At most [`MAX_CONCURRENT_PROBES`] probes run at once;
    /// the whole batch completes before returning, in input order.
    pub async fn verify_all(
        &self,
        provider: Option<&str>,
        name: Option<&str>,
    ) -> Vec<VerifyResult> {
        let keys: Vec<ApiKeyRecord> = self
            .store
            .list_keys(provider)
            .into_iter()
            .filter(|k| name.is_none_or(|n| k.name == n))
            .collect();

        if keys.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = keys.len(), "verifying keys");

        futures::stream::iter(keys)
            .map(|key| self.verify_key(key))
            .buffered(MAX_CONCURRENT_PROBES)
            .collect()
            .await
    }

    async fn verify_key(&self, record: ApiKeyRecord) -> VerifyResult {
        let provider = canonical_provider(&record.provider);

        let Some(endpoint) = self.endpoints.get(&provider) else {
            return VerifyResult {
                name: record.name,
                provider: record.provider,
                status: KeyStatus::Unsupported,
                message: format!("provider '{provider}' does not support verification"),
            };
        };

        // A decryption failure is this key's own result, not a batch error.
        let value = match self.store.get_value(&record.name, "verify") {
            Ok(value) => value,
            Err(e) => {
                return VerifyResult {
                    name: record.name,
                    provider: record.provider,
                    status: KeyStatus::Error,
                    message: format!("failed to decrypt: {e}"),
                };
            }
        };

        let mut request = self.client.get(&endpoint.url).header(
            endpoint.auth_header.as_str(),
            format!("{}{}", endpoint.auth_prefix, value),
        );
        for (name, val) in &endpoint.extra_headers {
            request = request.header(name.as_str(), val.as_str());
        }

        let (status, message) = match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => (KeyStatus::Error, format!("request failed: {e}")),
        };

        VerifyResult {
            name: record.name,
            provider: record.provider,
            status,
            message,
        }
    }
}

fn classify_status(status: reqwest::StatusCode) -> (KeyStatus, String) {
    if status == reqwest::StatusCode::OK {
        (KeyStatus::Valid, "key is valid".to_string())
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        (
            KeyStatus::Invalid,
            format!("key rejected (HTTP {})", status.as_u16()),
        )
    } else {
        (
            KeyStatus::Error,
            format!("unexpected HTTP {}", status.as_u16()),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;

        assert_eq!(classify_status(StatusCode::OK).0, KeyStatus::Valid);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED).0, KeyStatus::Invalid);
        assert_eq!(classify_status(StatusCode::FORBIDDEN).0, KeyStatus::Invalid);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS).0, KeyStatus::Error);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).0, KeyStatus::Error);
    }

    #[test]
    fn provider_aliases_resolve() {
        assert_eq!(canonical_provider("Google"), "gemini");
        assert_eq!(canonical_provider("OPENAI"), "openai");
        assert_eq!(canonical_provider("anthropic"), "anthropic");
    }

    #[test]
    fn builtin_endpoints_cover_routed_providers() {
        let endpoints = builtin_endpoints();
        for provider in ["openai", "anthropic", "gemini", "deepseek", "zhipu"] {
            assert!(endpoints.contains_key(provider), "missing {provider}");
        }
    }
}
