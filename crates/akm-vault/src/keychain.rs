//! Platform secure-credential storage for the master key.
//!
//! The master key must never sit on disk in plaintext.  [`KeychainProvider`]
//! abstracts over platform backends:
//!
//! - **macOS**: Keychain Services via `security-framework`.
//! - **Fallback**: [`FileKeychain`] — the key file is encrypted under a
//!   device-derived key (hostname + username + application salt through
//!   PBKDF2).  Weaker than a real OS keychain, but the master key is never
//!   stored in the clear.
//!
//! One named entry holds the key, under fixed service/account identifiers.

use std::path::{Path, PathBuf};

use crate::crypto;
use crate::error::{Result, VaultError};

/// Keychain service identifier for the master key entry.
pub const SERVICE_NAME: &str = "apikey-manager";

/// Keychain account identifier for the master key entry.
pub const MASTER_KEY_ACCOUNT: &str = "master_key";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over platform-specific secure key storage.
///
/// Implementations must be `Send + Sync` so the engine can be shared across
/// tasks.
pub trait KeychainProvider: Send + Sync {
    /// Retrieve the master key bytes.
    ///
    /// Returns [`VaultError::MasterKeyNotFound`] if no key has been stored.
    fn get_master_key(&self) -> Result<Vec<u8>>;

    /// Store (or overwrite) the master key bytes.
    fn set_master_key(&self, key: &[u8]) -> Result<()>;

    /// Check whether a master key has been stored.
    fn has_master_key(&self) -> Result<bool>;

    /// Delete the stored master key.  Deleting a missing key is a no-op.
    fn delete_master_key(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-based fallback
// ---------------------------------------------------------------------------

/// Application salt mixed into the device-derived key.  Changing this
/// invalidates every previously stored key file.  Must be exactly
/// [`crypto::SALT_LEN`] (32) bytes.
const APP_SALT: &[u8; crypto::SALT_LEN] = b"apikey-manager-keychain-v1\x00\x00\x00\x00\x00\x00";

/// File-based keychain storing the master key encrypted under a
/// device-derived key.
///
/// Key file layout (binary): `[12 bytes nonce][ciphertext + 16-byte tag]`.
pub struct FileKeychain {
    key_file: PathBuf,
}

impl FileKeychain {
    /// Create a file-based keychain storing the key at `key_file`.  The file
    /// itself is created on [`set_master_key`](KeychainProvider::set_master_key).
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    /// Default key file location: `<data_dir>/master.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("master.key")
    }

    /// Derive the encryption key for the key file from machine-specific
    /// identifiers.  Deterministic per machine/user combination.
    fn device_derived_key(&self) -> [u8; crypto::KEY_LEN] {
        let hostname = hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material = Vec::with_capacity(hostname.len() + username.len() + APP_SALT.len());
        material.extend_from_slice(hostname.as_bytes());
        material.extend_from_slice(username.as_bytes());
        material.extend_from_slice(APP_SALT);

        let mut key = [0u8; crypto::KEY_LEN];
        crypto::derive_key_with_salt(&material, APP_SALT, &mut key);
        key
    }
}

/// System hostname, falling back to "unknown-host".
fn hostname() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}

impl KeychainProvider for FileKeychain {
    fn get_master_key(&self) -> Result<Vec<u8>> {
        if !self.key_file.exists() {
            return Err(VaultError::MasterKeyNotFound);
        }

        let data = std::fs::read(&self.key_file)?;
        let device_key = self.device_derived_key();
        let key = crypto::open(&device_key, &data)?;

        tracing::debug!("retrieved master key from file keychain");
        Ok(key)
    }

    fn set_master_key(&self, key: &[u8]) -> Result<()> {
        let device_key = self.device_derived_key();
        let sealed = crypto::seal(&device_key, key)?;

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_file, &sealed)?;

        // Owner read/write only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.key_file, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %self.key_file.display(), "stored master key in file keychain");
        Ok(())
    }

    fn has_master_key(&self) -> Result<bool> {
        Ok(self.key_file.exists())
    }

    fn delete_master_key(&self) -> Result<()> {
        if self.key_file.exists() {
            std::fs::remove_file(&self.key_file)?;
            tracing::info!(path = %self.key_file.display(), "deleted master key from file keychain");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// macOS Keychain Services
// ---------------------------------------------------------------------------

/// Security framework error code for "item not found"
/// (`errSecItemNotFound = -25300`).
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// macOS Keychain Services backend via the `security-framework` crate.
///
/// Stores the master key in the user's login keychain as a generic password
/// under [`SERVICE_NAME`]/[`MASTER_KEY_ACCOUNT`].
#[cfg(target_os = "macos")]
pub struct MacOSKeychain {
    service_name: String,
    account_name: String,
}

#[cfg(target_os = "macos")]
impl MacOSKeychain {
    /// Create a provider using the fixed service and account identifiers.
    pub fn new() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            account_name: MASTER_KEY_ACCOUNT.to_string(),
        }
    }

    /// Create a provider with custom identifiers, for tests or parallel
    /// installations that must not share one keychain entry.
    pub fn with_names(service: &str, account: &str) -> Self {
        Self {
            service_name: service.to_string(),
            account_name: account.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
impl Default for MacOSKeychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
impl KeychainProvider for MacOSKeychain {
    fn get_master_key(&self) -> Result<Vec<u8>> {
        use security_framework::passwords::get_generic_password;

        match get_generic_password(&self.service_name, &self.account_name) {
            Ok(data) => Ok(data.to_vec()),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => {
                Err(VaultError::MasterKeyNotFound)
            }
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain read failed: {e}"),
            }),
        }
    }

    fn set_master_key(&self, key: &[u8]) -> Result<()> {
        use security_framework::passwords::set_generic_password;

        set_generic_password(&self.service_name, &self.account_name, key).map_err(|e| {
            VaultError::MasterKeyStoreFailed {
                reason: format!("macOS keychain write failed: {e}"),
            }
        })?;

        tracing::info!(service = %self.service_name, "stored master key in macOS keychain");
        Ok(())
    }

    fn has_master_key(&self) -> Result<bool> {
        use security_framework::passwords::get_generic_password;

        match get_generic_password(&self.service_name, &self.account_name) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(false),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain check failed: {e}"),
            }),
        }
    }

    fn delete_master_key(&self) -> Result<()> {
        use security_framework::passwords::delete_generic_password;

        match delete_generic_password(&self.service_name, &self.account_name) {
            Ok(()) => {
                tracing::info!(service = %self.service_name, "deleted master key from macOS keychain");
                Ok(())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain delete failed: {e}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Best available keychain provider for the current platform.
///
/// macOS gets Keychain Services; everything else falls back to the encrypted
/// key file under `data_dir`.  Callers should not need to know which backend
/// is in use.
pub fn platform_keychain(data_dir: &Path) -> Box<dyn KeychainProvider> {
    let _ = &data_dir;

    #[cfg(target_os = "macos")]
    {
        tracing::info!("using macOS Keychain Services for master key storage");
        Box::new(MacOSKeychain::new())
    }
    #[cfg(not(target_os = "macos"))]
    {
        let path = FileKeychain::default_path(data_dir);
        tracing::info!(path = %path.display(), "using file-based keychain for master key storage");
        Box::new(FileKeychain::new(path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("master.key"));

        assert!(!keychain.has_master_key().unwrap());

        let original = crypto::random_bytes(crypto::KEY_LEN).unwrap();
        keychain.set_master_key(&original).unwrap();
        assert!(keychain.has_master_key().unwrap());

        assert_eq!(keychain.get_master_key().unwrap(), original);

        keychain.delete_master_key().unwrap();
        assert!(!keychain.has_master_key().unwrap());
    }

    #[test]
    fn get_missing_key_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("missing.key"));

        let result = keychain.get_master_key();
        assert!(matches!(result, Err(VaultError::MasterKeyNotFound)));
    }

    #[test]
    fn overwrite_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("master.key"));

        let key1 = crypto::random_bytes(crypto::KEY_LEN).unwrap();
        let key2 = crypto::random_bytes(crypto::KEY_LEN).unwrap();

        keychain.set_master_key(&key1).unwrap();
        keychain.set_master_key(&key2).unwrap();

        assert_eq!(keychain.get_master_key().unwrap(), key2);
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("never-set.key"));
        keychain.delete_master_key().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn key_file_permissions_are_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let keychain = FileKeychain::new(&path);

        let key = crypto::random_bytes(crypto::KEY_LEN).unwrap();
        keychain.set_master_key(&key).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn platform_keychain_returns_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = platform_keychain(dir.path());
        // The trait object must be usable regardless of the backend.
        let _ = provider.has_master_key();
    }
}
