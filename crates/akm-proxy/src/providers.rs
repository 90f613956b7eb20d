//! Provider routing data.
//!
//! [`ProviderTable`] holds everything the proxy needs to know about an
//! upstream vendor: its base URL, its authentication header convention, and
//! the model-name prefixes that identify it.  Routing is pure data — adding a
//! provider is a table entry, not new logic.

use std::collections::HashMap;

use crate::error::{ProxyError, Result};

/// How to reach one provider's API.
#[derive(Debug, Clone)]
pub struct ProviderRoute {
    /// Upstream base URL, e.g. `https://api.openai.com`.
    pub base_url: String,
    /// Header carrying the credential, e.g. `Authorization`, `x-api-key`.
    pub auth_header: String,
    /// Prefix prepended to the key value, e.g. `Bearer `.
    pub auth_prefix: String,
    /// Additional fixed headers the provider requires.
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderRoute {
    fn new(base_url: &str, auth_header: &str, auth_prefix: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
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

/// Static routing configuration: provider routes plus the model-prefix map
/// used to infer a provider from a request body.
#[derive(Debug, Clone)]
pub struct ProviderTable {
    routes: HashMap<String, ProviderRoute>,
    model_prefixes: Vec<(String, String)>,
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderTable {
    /// The builtin provider set.
    pub fn builtin() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            "openai".to_string(),
            ProviderRoute::new("https://api.openai.com", "Authorization", "Bearer "),
        );
        routes.insert(
            "anthropic".to_string(),
            ProviderRoute::new("https://api.anthropic.com", "x-api-key", "")
                .with_header("anthropic-version", "2023-06-01"),
        );
        routes.insert(
            "deepseek".to_string(),
            ProviderRoute::new("https://api.deepseek.com", "Authorization", "Bearer "),
        );
        routes.insert(
            "gemini".to_string(),
            ProviderRoute::new(
                "https://generativelanguage.googleapis.com",
                "x-goog-api-key",
                "",
            ),
        );
        routes.insert(
            "zhipu".to_string(),
            ProviderRoute::new("https://open.bigmodel.cn/api/paas", "Authorization", "Bearer "),
        );

        let model_prefixes = [
            ("gpt-", "openai"),
            ("o1-", "openai"),
            ("o3-", "openai"),
            ("o4-", "openai"),
            ("claude-", "anthropic"),
            ("deepseek-", "deepseek"),
            ("gemini-", "gemini"),
            ("glm-", "zhipu"),
        ]
        .into_iter()
        .map(|(prefix, provider)| (prefix.to_string(), provider.to_string()))
        .collect();

        Self {
            routes,
            model_prefixes,
        }
    }

    /// An empty table, for deployments that define their own routes.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
            model_prefixes: Vec::new(),
        }
    }

    /// Register (or replace) a provider route.
    pub fn insert_route(&mut self, provider: &str, route: ProviderRoute) {
        self.routes.insert(provider.to_string(), route);
    }

    /// Register a model-name prefix mapping to a provider.
    pub fn insert_model_prefix(&mut self, prefix: &str, provider: &str) {
        self.model_prefixes
            .push((prefix.to_string(), provider.to_string()));
    }

    /// Look up a provider's route.
    pub fn route(&self, provider: &str) -> Option<&ProviderRoute> {
        self.routes.get(provider)
    }

    /// Determine the target provider for a request.
    ///
    /// An explicit override header wins outright — an unknown value there is
    /// an error, never a fallback to body inference.  Without the header, the
    /// provider is inferred from a recognized prefix of the body's `model`
    /// field.  Failure to resolve rejects the request.
    pub fn resolve(&self, header: Option<&str>, body: &[u8]) -> Result<String> {
        if let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) {
            let provider = header.to_lowercase();
            return if self.routes.contains_key(&provider) {
                Ok(provider)
            } else {
                Err(ProxyError::UnknownProvider(provider))
            };
        }

        #[derive(serde::Deserialize)]
        struct ModelBody {
            #[serde(default)]
            model: String,
        }

        if let Ok(parsed) = serde_json::from_slice::<ModelBody>(body) {
            if !parsed.model.is_empty() {
                let model = parsed.model.to_lowercase();
                for (prefix, provider) in &self.model_prefixes {
                    if model.starts_with(prefix.as_str()) {
                        return Ok(provider.clone());
                    }
                }
            }
        }

        Err(ProxyError::UnresolvedProvider)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
