//! The akm server binary: builds the crypto engine, key store, and budget
//! tracker once at startup and serves the proxy plus the admin API.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use akm_budget::BudgetTracker;
use akm_proxy::state::AppState;
use akm_proxy::server::{ServerConfig, serve};
use akm_vault::crypto::CryptoEngine;
use akm_vault::keychain::platform_keychain;
use akm_vault::store::KeyStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let data_dir = data_dir()?;
    tracing::info!(data_dir = %data_dir.display(), "starting akm");

    let crypto = Arc::new(CryptoEngine::new(platform_keychain(&data_dir)));
    crypto.initialize()?;

    let store = Arc::new(KeyStore::open(&data_dir, Arc::clone(&crypto))?);
    if store.load_failed() {
        tracing::warn!(
            "keys file could not be decrypted; the store is empty and saving is disabled"
        );
    }

    let budget = BudgetTracker::open(data_dir.join("budget.json"))?;

    let admin_token = config.admin_token.clone();
    let state = Arc::new(AppState::new(store, budget).with_admin_token(admin_token));

    serve(config, state).await
}

/// Data directory: `AKM_DATA_DIR`, or `~/.apikey-manager/data`.
fn data_dir() -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    if let Ok(dir) = std::env::var("AKM_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| "cannot determine home directory; set AKM_DATA_DIR")?;
    Ok(PathBuf::from(home).join(".apikey-manager").join("data"))
}
