//! Provider-aware reverse proxy and key verifier for akm.
//!
//! The proxy accepts OpenAI-compatible requests, resolves the target
//! provider (explicit header or model-name inference), enforces per-provider
//! budgets, injects a stored key, and forwards transparently.  The verifier
//! probes stored keys against their providers under a bounded worker pool.
//!
//! # Modules
//!
//! - [`providers`] — static provider routing data.
//! - [`proxy`] — the reverse-proxy request pipeline.
//! - [`verifier`] — concurrent key verification.
//! - [`server`] — router assembly and startup.
//! - [`api`] — REST admin handlers over the core interfaces.
//! - [`state`] — shared application state.
//! - [`error`] — unified error types with HTTP mapping.

pub mod api;
pub mod error;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod state;
pub mod verifier;

pub use error::{ProxyError, Result};
pub use providers::{ProviderRoute, ProviderTable};
pub use server::{ServerConfig, router, serve};
pub use state::AppState;
pub use verifier::{KeyStatus, Verifier, VerifyResult};
