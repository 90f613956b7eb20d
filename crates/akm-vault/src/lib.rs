//! Encrypted API key vault for akm.
//!
//! Secrets are encrypted at rest with AES-256-GCM under a single master key
//! held in the platform keychain, every access is recorded in a signed
//! append-only audit trail, and the whole store persists as one encrypted
//! blob replaced atomically on every mutation.
//!
//! # Modules
//!
//! - [`crypto`] — AES-256-GCM engine, HMAC signing, master-key lifecycle.
//! - [`keychain`] — platform secure-credential storage for the master key.
//! - [`store`] — encrypted key store with atomic persistence.
//! - [`audit`] — signed append-only audit log.
//! - [`error`] — unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use akm_vault::crypto::CryptoEngine;
//! use akm_vault::keychain::platform_keychain;
//! use akm_vault::store::{KeyStore, KeyOptions};
//!
//! # fn example() -> akm_vault::Result<()> {
//! let data_dir = std::path::Path::new("data");
//! let crypto = Arc::new(CryptoEngine::new(platform_keychain(data_dir)));
//! crypto.initialize()?;
//!
//! let store = KeyStore::open(data_dir, Arc::clone(&crypto))?;
//! store.add_key("OPENAI_KEY", "sk-...", "openai", KeyOptions::default())?;
//!
//! let value = store.get_value("OPENAI_KEY", "my-project")?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod crypto;
pub mod error;
pub mod keychain;
pub mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditAction, AuditEntry, AuditReport};
pub use crypto::CryptoEngine;
pub use error::{Result, VaultError};
pub use keychain::{FileKeychain, KeychainProvider, platform_keychain};
pub use store::{ApiKeyRecord, KeyOptions, KeyStore, KeyUpdate};
