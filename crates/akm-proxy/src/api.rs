//! REST admin API route handlers.
//!
//! Thin adapters over the core interfaces: key CRUD, dotenv export, budget
//! stats, verification, and a health endpoint.  Key values never appear in
//! list/get responses — only [`KeyStore::get_value`]-style operations on the
//! core decrypt, and the export endpoint is the single place that returns
//! plaintext.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use akm_budget::ProviderStats;
use akm_vault::store::escape_dotenv_value;
use akm_vault::{ApiKeyRecord, KeyOptions, VaultError};

use crate::state::AppState;
use crate::verifier::{Verifier, VerifyResult};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Vault errors surfaced through the admin API.
pub struct ApiError(VaultError);

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VaultError::InvalidKeyName { .. } | VaultError::EmptyValue => StatusCode::BAD_REQUEST,
            VaultError::KeyNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A key record without its encrypted value.
#[derive(Serialize)]
pub struct KeySummary {
    pub name: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_project: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl From<ApiKeyRecord> for KeySummary {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            name: record.name,
            provider: record.provider,
            description: record.description,
            source_project: record.source_project,
            tags: record.tags,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            is_active: record.is_active,
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub provider: Option<String>,
}

#[derive(Deserialize)]
pub struct AddKeyRequest {
    pub name: String,
    pub value: String,
    pub provider: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
pub struct ExportEnvRequest {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub names: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub provider: Option<String>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "keys": state.store.list_keys(None).len(),
        "audit_failures": state.store.audit_failures(),
        "budget_persist_failures": state.budget.persist_failures(),
    }))
}

/// GET /api/keys
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<KeySummary>> {
    let keys = state
        .store
        .list_keys(query.provider.as_deref())
        .into_iter()
        .map(KeySummary::from)
        .collect();
    Json(keys)
}

/// POST /api/keys
pub async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeyRequest>,
) -> std::result::Result<(StatusCode, Json<KeySummary>), ApiError> {
    let record = state.store.add_key(
        &request.name,
        &request.value,
        &request.provider,
        KeyOptions {
            description: request.description,
            source_project: request.source_project,
            tags: request.tags,
        },
    )?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// GET /api/keys/{name}
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> std::result::Result<Json<KeySummary>, ApiError> {
    let record = state
        .store
        .get_key(&name)
        .ok_or(VaultError::KeyNotFound { name })?;
    Ok(Json(record.into()))
}

/// DELETE /api/keys/{name}
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.store.delete_key(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/export/env — render matching keys as dotenv lines.
pub async fn export_env(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExportEnvRequest>,
) -> std::result::Result<String, ApiError> {
    let project = request.project.as_deref().unwrap_or("api");
    let keys = state.store.keys_for_export(
        project,
        request.provider.as_deref(),
        request.names.as_deref(),
    )?;

    let mut out = String::new();
    for (name, value) in keys {
        out.push_str(&format!("{}=\"{}\"\n", name, escape_dotenv_value(&value)));
    }
    Ok(out)
}

/// GET /api/budget
pub async fn budget_stats(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderStats>> {
    Json(state.budget.all_stats())
}

/// POST /api/verify — probe stored keys against their providers.
pub async fn verify_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Json<Vec<VerifyResult>> {
    let verifier = Verifier::new(Arc::clone(&state.store));
    let results = verifier
        .verify_all(query.provider.as_deref(), query.name.as_deref())
        .await;
    Json(results)
}
