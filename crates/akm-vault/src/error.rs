//! Vault error types.
//!
//! Every public API in this crate returns [`VaultError`].  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for the akm vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Validation errors --------------------------------------------------
    /// The key name is not a valid environment-variable style identifier.
    #[error(
        "invalid key name '{name}': must start with a letter or underscore, \
         contain only alphanumerics and underscores, max 256 chars"
    )]
    InvalidKeyName { name: String },

    /// The key value is empty.
    #[error("key value must not be empty")]
    EmptyValue,

    // -- Lookup errors ------------------------------------------------------
    /// The requested key does not exist in the store.
    #[error("key '{name}' not found")]
    KeyNotFound { name: String },

    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Authentication failed on decrypt or signature verification: wrong
    /// key, tampered ciphertext, or a malformed token.
    #[error("integrity check failed: {reason}")]
    Integrity { reason: String },

    /// The crypto engine has no master key loaded.
    #[error("encryption engine not initialized")]
    NotInitialized,

    // -- Keychain errors ----------------------------------------------------
    /// The master key could not be retrieved from the keychain.
    #[error("master key not found in keychain")]
    MasterKeyNotFound,

    /// Writing the master key to the keychain failed.
    #[error("failed to store master key: {reason}")]
    MasterKeyStoreFailed { reason: String },

    /// The keychain backend is unavailable on this platform.
    #[error("keychain unavailable: {reason}")]
    KeychainUnavailable { reason: String },

    // -- Persistence errors -------------------------------------------------
    /// Writing or renaming the store file failed.  The in-memory mutation
    /// that triggered the save has been rolled back.
    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    /// The keys file could not be loaded (wrong/reset master key or
    /// corruption).  The store refuses to save until the failure is
    /// explicitly cleared, so unreadable data is never overwritten.
    #[error("refusing to save: keys file failed to load and saving could overwrite it")]
    StoreLoadFailed,

    // -- Underlying errors --------------------------------------------------
    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
