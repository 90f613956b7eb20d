//! Shared application state for the proxy server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers.  Everything is constructed explicitly at process start and
//! passed by reference — no global singletons.

use std::sync::Arc;
use std::time::Duration;

use akm_budget::BudgetTracker;
use akm_vault::KeyStore;

use crate::providers::ProviderTable;

/// Timeout for forwarded upstream calls.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared state accessible from every handler.
#[derive(Clone)]
pub struct AppState {
    /// The encrypted key store.
    pub store: Arc<KeyStore>,

    /// Per-provider budget tracker.
    pub budget: BudgetTracker,

    /// Provider routing tables.
    pub providers: Arc<ProviderTable>,

    /// Client used for the single outbound call per proxied request.
    pub http: reqwest::Client,

    /// Optional admin token guarding the API and proxy routes.
    pub admin_token: Option<String>,
}

impl AppState {
    /// Build state with the builtin provider table and a default client.
    pub fn new(store: Arc<KeyStore>, budget: BudgetTracker) -> Self {
        Self::with_providers(store, budget, ProviderTable::builtin())
    }

    /// Build state with a custom provider table.
    pub fn with_providers(
        store: Arc<KeyStore>,
        budget: BudgetTracker,
        providers: ProviderTable,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("akm/", env!("CARGO_PKG_VERSION")))
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            store,
            budget,
            providers: Arc::new(providers),
            http,
            admin_token: None,
        }
    }

    /// Require `token` on every request except health checks.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }
}
