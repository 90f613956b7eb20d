//! Encrypted API key store with atomic persistence.
//!
//! [`KeyStore`] owns the in-memory record map and the on-disk keys file.
//! The whole map is serialized, encrypted as one blob, and written with a
//! temp-write-then-rename so a crash mid-write never corrupts the previously
//! committed file.  Every mutation appends one signed audit entry.
//!
//! # Mutation protocol
//!
//! 1. Apply the change in memory.
//! 2. Serialize the full map, encrypt, atomic-replace on disk.
//! 3. On persistence failure, roll the in-memory change back and surface the
//!    error — partial state is never observable.
//! 4. Append a signed audit entry.
//!
//! # Load behavior
//!
//! A legacy plaintext keys file is imported as-is and flagged for
//! re-encryption on the next save.  If the file cannot be decrypted (wrong or
//! reset master key, corruption) the store starts empty and refuses to save
//! until the failure is explicitly cleared, so unreadable data is never
//! silently overwritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::audit::{AuditAction, AuditLog, AuditReport};
use crate::crypto::CryptoEngine;
use crate::error::{Result, VaultError};

/// Current on-disk format version.
const KEYS_FILE_VERSION: &str = "2.0";

/// File names inside the data directory.
const KEYS_FILE: &str = "keys.json";
const KEYS_TEMP_FILE: &str = ".keys_temp.json";
const AUDIT_FILE: &str = "audit.jsonl";

static KEY_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("key name regex"));

/// Whether `name` is a valid environment-variable style key name:
/// starts with a letter or underscore, alphanumerics/underscores only,
/// at most 256 characters.
pub fn validate_key_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 256 && KEY_NAME_RE.is_match(name)
}

/// Escape a value for `.env` file output.
pub fn escape_dotenv_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An encrypted API key with its metadata.
///
/// `value_encrypted` holds the base64 token produced by
/// [`CryptoEngine::encrypt`]; the plaintext is only ever materialized on
/// demand by [`KeyStore::get_value`] and the batch retrieval calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub name: String,
    pub value_encrypted: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_project: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,

    // Model metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_capabilities: Vec<String>,
}

impl ApiKeyRecord {
    fn new(name: &str, value_encrypted: String, provider: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            value_encrypted,
            provider: provider.to_string(),
            description: None,
            source_project: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_active: true,
            model_name: None,
            model_version: None,
            model_capabilities: Vec::new(),
        }
    }
}

/// Optional metadata supplied when adding a key.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub description: Option<String>,
    pub source_project: Option<String>,
    pub tags: Vec<String>,
}

/// Typed partial update for a key's metadata.  Each field is applied only
/// when present; the encrypted value itself is never touched.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub provider: Option<String>,
    pub description: Option<String>,
    pub source_project: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

/// On-disk shape of the keys file.  The legacy format stores this JSON in
/// plaintext; the current format encrypts the same JSON as one blob.
#[derive(Debug, Serialize, Deserialize)]
struct KeysFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    keys: Vec<ApiKeyRecord>,
}

#[derive(Default)]
struct StoreInner {
    keys: BTreeMap<String, ApiKeyRecord>,
    load_failed: bool,
    needs_reencrypt: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Encrypted key store with signed audit logging.
pub struct KeyStore {
    data_dir: PathBuf,
    keys_file: PathBuf,
    crypto: Arc<CryptoEngine>,
    audit: AuditLog,
    inner: RwLock<StoreInner>,
}

impl KeyStore {
    /// Open the store rooted at `data_dir`, creating the directory with
    /// restrictive permissions if needed.
    ///
    /// A keys file that fails to decrypt does not fail construction: the
    /// store starts empty with saving disabled (see
    /// [`clear_load_failure`](Self::clear_load_failure)).
    pub fn open(data_dir: impl Into<PathBuf>, crypto: Arc<CryptoEngine>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let store = Self {
            keys_file: data_dir.join(KEYS_FILE),
            audit: AuditLog::new(data_dir.join(AUDIT_FILE), Arc::clone(&crypto)),
            data_dir,
            crypto,
            inner: RwLock::new(StoreInner::default()),
        };

        {
            let mut inner = store.write_inner();
            if let Err(e) = store.load(&mut inner) {
                tracing::warn!(error = %e, "failed to load keys file; starting empty with saving disabled");
                inner.keys.clear();
                inner.load_failed = true;
            }
        }

        Ok(store)
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, inner: &mut StoreInner) -> Result<()> {
        let data = match std::fs::read(&self.keys_file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // Legacy plaintext format: parses directly as JSON with a version.
        if let Ok(file) = serde_json::from_slice::<KeysFile>(&data) {
            if !file.version.is_empty() {
                tracing::warn!(
                    "legacy plaintext keys file detected; it will be encrypted on the next save"
                );
                for key in file.keys {
                    inner.keys.insert(key.name.clone(), key);
                }
                inner.needs_reencrypt = true;
                return Ok(());
            }
        }

        // Current format: the whole file is one encrypted token.
        let token = String::from_utf8(data).map_err(|_| VaultError::Integrity {
            reason: "keys file is neither legacy JSON nor an encrypted token".into(),
        })?;
        let decrypted = self.crypto.decrypt(token.trim())?;
        let file: KeysFile = serde_json::from_slice(&decrypted)?;

        for key in file.keys {
            inner.keys.insert(key.name.clone(), key);
        }

        tracing::debug!(count = inner.keys.len(), "loaded keys file");
        Ok(())
    }

    /// Serialize, encrypt, and atomically replace the keys file.  Must be
    /// called with the write lock held.
    fn save(&self, inner: &mut StoreInner) -> Result<()> {
        if inner.load_failed {
            return Err(VaultError::StoreLoadFailed);
        }

        let file = KeysFile {
            version: KEYS_FILE_VERSION.to_string(),
            updated_at: Utc::now().to_rfc3339(),
            keys: inner.keys.values().cloned().collect(),
        };

        let json = serde_json::to_vec_pretty(&file)?;
        let encrypted = self.crypto.encrypt(&json)?;

        let temp = self.data_dir.join(KEYS_TEMP_FILE);
        std::fs::write(&temp, encrypted.as_bytes()).map_err(|e| VaultError::Persistence {
            reason: format!("failed to write temp file: {e}"),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600));
        }
        if let Err(e) = std::fs::rename(&temp, &self.keys_file) {
            let _ = std::fs::remove_file(&temp);
            return Err(VaultError::Persistence {
                reason: format!("failed to rename temp file: {e}"),
            });
        }

        if inner.needs_reencrypt {
            inner.needs_reencrypt = false;
            tracing::info!("legacy keys file upgraded to encrypted format");
        }
        Ok(())
    }

    // -- Mutations ----------------------------------------------------------

    /// Add a key (replacing an existing record of the same name).
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidKeyName`] / [`VaultError::EmptyValue`] before any
    /// state change; [`VaultError::Persistence`] with the in-memory insert
    /// rolled back.
    pub fn add_key(
        &self,
        name: &str,
        value: &str,
        provider: &str,
        opts: KeyOptions,
    ) -> Result<ApiKeyRecord> {
        if !validate_key_name(name) {
            return Err(VaultError::InvalidKeyName {
                name: name.to_string(),
            });
        }
        if value.is_empty() {
            return Err(VaultError::EmptyValue);
        }

        let encrypted = self.crypto.encrypt(value.as_bytes())?;
        let mut record = ApiKeyRecord::new(name, encrypted, provider);
        record.description = opts.description;
        record.source_project = opts.source_project;
        record.tags = opts.tags;

        {
            let mut inner = self.write_inner();
            let previous = inner.keys.insert(name.to_string(), record.clone());
            if let Err(e) = self.save(&mut inner) {
                // Roll back the insert.
                match previous {
                    Some(prev) => inner.keys.insert(name.to_string(), prev),
                    None => inner.keys.remove(name),
                };
                return Err(e);
            }
        }

        self.audit.append(name, "system", AuditAction::Add);
        tracing::info!(name, provider, "added key");
        Ok(record)
    }

    /// Apply a typed partial update to a key's metadata.
    pub fn update_key(&self, name: &str, update: KeyUpdate) -> Result<ApiKeyRecord> {
        let updated = {
            let mut inner = self.write_inner();
            let record = inner
                .keys
                .get_mut(name)
                .ok_or_else(|| VaultError::KeyNotFound {
                    name: name.to_string(),
                })?;
            let previous = record.clone();
            if let Some(provider) = update.provider {
                record.provider = provider;
            }
            if let Some(description) = update.description {
                record.description = Some(description);
            }
            if let Some(source_project) = update.source_project {
                record.source_project = Some(source_project);
            }
            if let Some(tags) = update.tags {
                record.tags = tags;
            }
            if let Some(is_active) = update.is_active {
                record.is_active = is_active;
            }
            record.updated_at = Utc::now();
            let updated = record.clone();

            if let Err(e) = self.save(&mut inner) {
                inner.keys.insert(name.to_string(), previous);
                return Err(e);
            }
            updated
        };

        self.audit.append(name, "system", AuditAction::Update);
        tracing::info!(name, "updated key");
        Ok(updated)
    }

    /// Delete a key.
    pub fn delete_key(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.write_inner();
            let removed = inner
                .keys
                .remove(name)
                .ok_or_else(|| VaultError::KeyNotFound {
                    name: name.to_string(),
                })?;

            if let Err(e) = self.save(&mut inner) {
                inner.keys.insert(name.to_string(), removed);
                return Err(e);
            }
        }

        self.audit.append(name, "system", AuditAction::Delete);
        tracing::info!(name, "deleted key");
        Ok(())
    }

    // -- Reads --------------------------------------------------------------

    /// Key metadata without the decrypted value.
    pub fn get_key(&self, name: &str) -> Option<ApiKeyRecord> {
        self.read_inner().keys.get(name).cloned()
    }

    /// Decrypt a key's value on demand.  The plaintext is never cached.
    /// Logs a `read` audit entry tagged with the caller's `project`.
    pub fn get_value(&self, name: &str, project: &str) -> Result<String> {
        let record = self
            .get_key(name)
            .ok_or_else(|| VaultError::KeyNotFound {
                name: name.to_string(),
            })?;

        let value = self.crypto.decrypt_string(&record.value_encrypted)?;
        self.audit.append(name, project, AuditAction::Read);
        Ok(value)
    }

    /// All keys, optionally filtered by provider, in name order.
    pub fn list_keys(&self, provider: Option<&str>) -> Vec<ApiKeyRecord> {
        self.read_inner()
            .keys
            .values()
            .filter(|k| provider.is_none_or(|p| k.provider == p))
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over name, provider, description,
    /// and source project.
    pub fn search_keys(&self, query: &str) -> Vec<ApiKeyRecord> {
        let query = query.to_lowercase();
        self.read_inner()
            .keys
            .values()
            .filter(|k| {
                k.name.to_lowercase().contains(&query)
                    || k.provider.to_lowercase().contains(&query)
                    || k.description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&query))
                    || k.source_project
                        .as_deref()
                        .is_some_and(|s| s.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    /// Decrypted name→value map for environment injection.  Logs one
    /// `inject` entry per matched record.
    pub fn keys_for_injection(
        &self,
        project: &str,
        provider: Option<&str>,
        names: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>> {
        self.get_batch(project, provider, names, AuditAction::Inject)
    }

    /// Decrypted name→value map for export.  Logs one `export` entry per
    /// matched record.
    pub fn keys_for_export(
        &self,
        project: &str,
        provider: Option<&str>,
        names: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>> {
        self.get_batch(project, provider, names, AuditAction::Export)
    }

    fn get_batch(
        &self,
        project: &str,
        provider: Option<&str>,
        names: Option<&[String]>,
        action: AuditAction,
    ) -> Result<BTreeMap<String, String>> {
        let matched: Vec<(String, String)> = {
            let inner = self.read_inner();
            inner
                .keys
                .values()
                .filter(|k| provider.is_none_or(|p| k.provider == p))
                .filter(|k| names.is_none_or(|ns| ns.iter().any(|n| n == &k.name)))
                .map(|k| (k.name.clone(), k.value_encrypted.clone()))
                .collect()
        };

        let mut result = BTreeMap::new();
        for (name, encrypted) in matched {
            let value = self
                .crypto
                .decrypt_string(&encrypted)
                .map_err(|_| VaultError::Integrity {
                    reason: format!("failed to decrypt key '{name}'"),
                })?;
            self.audit.append(&name, project, action);
            result.insert(name, value);
        }
        Ok(result)
    }

    /// Record that a key was used to authenticate a proxied request.
    pub fn record_proxy_use(&self, name: &str, project: &str) {
        self.audit.append(name, project, AuditAction::Proxy);
    }

    // -- Maintenance --------------------------------------------------------

    /// Copy the keys and audit files into `backup_dir`.
    pub fn backup(&self, backup_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(backup_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(backup_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        if self.keys_file.exists() {
            std::fs::copy(&self.keys_file, backup_dir.join(KEYS_FILE))?;
        }
        if self.audit.path().exists() {
            std::fs::copy(self.audit.path(), backup_dir.join(AUDIT_FILE))?;
        }

        self.audit.append("*", "system", AuditAction::Backup);
        tracing::info!(dir = %backup_dir.display(), "backup created");
        Ok(())
    }

    /// Replay and classify every audit line.
    pub fn verify_audit_logs(&self) -> Result<AuditReport> {
        self.audit.verify_all()
    }

    /// Cumulative audit-write failure count.
    pub fn audit_failures(&self) -> u64 {
        self.audit.failures()
    }

    /// Whether the keys file failed to load (saving is refused while set).
    pub fn load_failed(&self) -> bool {
        self.read_inner().load_failed
    }

    /// Explicitly accept the loss of an unreadable keys file and re-enable
    /// saving.
    pub fn clear_load_failure(&self) {
        let mut inner = self.write_inner();
        if inner.load_failed {
            inner.load_failed = false;
            tracing::warn!("load failure cleared; the next save will overwrite the keys file");
        }
    }

    /// Whether a legacy plaintext file is pending re-encryption.
    pub fn needs_reencrypt(&self) -> bool {
        self.read_inner().needs_reencrypt
    }

    /// The data directory this store persists into.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::FileKeychain;

    fn test_engine(dir: &Path) -> Arc<CryptoEngine> {
        let engine = CryptoEngine::new(Box::new(FileKeychain::new(dir.join("master.key"))));
        engine.initialize().unwrap();
        Arc::new(engine)
    }

    fn test_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_engine(dir.path());
        let store = KeyStore::open(dir.path().join("data"), crypto).unwrap();
        (dir, store)
    }

    #[test]
    fn name_validation() {
        assert!(validate_key_name("OPENAI_KEY"));
        assert!(validate_key_name("_X9"));
        assert!(validate_key_name("a"));

        assert!(!validate_key_name("1KEY"));
        assert!(!validate_key_name(""));
        assert!(!validate_key_name("has space"));
        assert!(!validate_key_name("dash-ed"));
        assert!(!validate_key_name(&"A".repeat(257)));
        assert!(validate_key_name(&"A".repeat(256)));
    }

    #[test]
    fn dotenv_escaping() {
        assert_eq!(escape_dotenv_value(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_dotenv_value("a\\b"), "a\\\\b");
        assert_eq!(escape_dotenv_value("a\nb"), "a\\nb");
        assert_eq!(escape_dotenv_value("a\rb"), "a\\rb");
    }

    #[test]
    fn add_get_roundtrip() {
        let (_dir, store) = test_store();

        let record = store
            .add_key(
                "OPENAI_KEY",
                "sk-test-123",
                "openai",
                KeyOptions {
                    description: Some("work key".into()),
                    source_project: Some("demo".into()),
                    tags: vec!["prod".into()],
                },
            )
            .unwrap();
        assert!(record.is_active);
        assert_ne!(record.value_encrypted, "sk-test-123");

        let value = store.get_value("OPENAI_KEY", "test-proj").unwrap();
        assert_eq!(value, "sk-test-123");

        let meta = store.get_key("OPENAI_KEY").unwrap();
        assert_eq!(meta.description.as_deref(), Some("work key"));
        assert_eq!(meta.tags, vec!["prod".to_string()]);
    }

    #[test]
    fn invalid_names_and_empty_values_rejected_before_state_change() {
        let (_dir, store) = test_store();

        assert!(matches!(
            store.add_key("1KEY", "v", "openai", KeyOptions::default()),
            Err(VaultError::InvalidKeyName { .. })
        ));
        assert!(matches!(
            store.add_key("OK", "", "openai", KeyOptions::default()),
            Err(VaultError::EmptyValue)
        ));
        assert!(store.list_keys(None).is_empty());
    }

    #[test]
    fn get_value_unknown_key() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get_value("NOPE", "p"),
            Err(VaultError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn list_filters_by_provider() {
        let (_dir, store) = test_store();
        store
            .add_key("A", "1", "openai", KeyOptions::default())
            .unwrap();
        store
            .add_key("B", "2", "anthropic", KeyOptions::default())
            .unwrap();
        store
            .add_key("C", "3", "openai", KeyOptions::default())
            .unwrap();

        assert_eq!(store.list_keys(None).len(), 3);
        let openai = store.list_keys(Some("openai"));
        assert_eq!(openai.len(), 2);
        assert!(openai.iter().all(|k| k.provider == "openai"));
    }

    #[test]
    fn search_is_case_insensitive_over_all_fields() {
        let (_dir, store) = test_store();
        store
            .add_key(
                "PROD_KEY",
                "v",
                "OpenAI",
                KeyOptions {
                    description: Some("Billing Dashboard".into()),
                    source_project: Some("acme-site".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(store.search_keys("prod").len(), 1);
        assert_eq!(store.search_keys("openai").len(), 1);
        assert_eq!(store.search_keys("billing").len(), 1);
        assert_eq!(store.search_keys("ACME").len(), 1);
        assert!(store.search_keys("missing").is_empty());
    }

    #[test]
    fn update_applies_only_present_fields() {
        let (_dir, store) = test_store();
        store
            .add_key(
                "K",
                "v",
                "openai",
                KeyOptions {
                    description: Some("original".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let updated = store
            .update_key(
                "K",
                KeyUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(!updated.is_active);
        assert_eq!(updated.description.as_deref(), Some("original"));
        assert_eq!(updated.provider, "openai");
        assert!(updated.updated_at >= updated.created_at);
    }

    #[test]
    fn update_unknown_key() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.update_key("NOPE", KeyUpdate::default()),
            Err(VaultError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn delete_then_absent() {
        let (_dir, store) = test_store();
        store
            .add_key("K", "v", "openai", KeyOptions::default())
            .unwrap();
        store.delete_key("K").unwrap();

        assert!(store.get_key("K").is_none());
        assert!(matches!(
            store.delete_key("K"),
            Err(VaultError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_engine(dir.path());
        let data_dir = dir.path().join("data");

        {
            let store = KeyStore::open(&data_dir, Arc::clone(&crypto)).unwrap();
            store
                .add_key("K", "persisted-value", "openai", KeyOptions::default())
                .unwrap();
        }

        let store = KeyStore::open(&data_dir, crypto).unwrap();
        assert_eq!(store.get_value("K", "p").unwrap(), "persisted-value");
    }

    #[test]
    fn keys_file_is_encrypted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_engine(dir.path());
        let data_dir = dir.path().join("data");
        let store = KeyStore::open(&data_dir, crypto).unwrap();
        store
            .add_key("K", "super-secret-value", "openai", KeyOptions::default())
            .unwrap();

        let raw = std::fs::read_to_string(data_dir.join(KEYS_FILE)).unwrap();
        assert!(!raw.contains("super-secret-value"));
        assert!(!raw.contains("\"keys\""));
    }

    #[test]
    fn legacy_plaintext_file_migrates_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_engine(dir.path());
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();

        // A v1 plaintext keys file as the legacy tool wrote it.  The value
        // token must be decryptable under the current master key.
        let legacy_value = crypto.encrypt(b"legacy-secret").unwrap();
        let legacy = serde_json::json!({
            "version": "1.0",
            "updated_at": "2024-01-01T00:00:00Z",
            "keys": [{
                "name": "LEGACY_KEY",
                "value_encrypted": legacy_value,
                "provider": "openai",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z",
                "is_active": true
            }]
        });
        std::fs::write(
            data_dir.join(KEYS_FILE),
            serde_json::to_vec_pretty(&legacy).unwrap(),
        )
        .unwrap();

        let store = KeyStore::open(&data_dir, Arc::clone(&crypto)).unwrap();
        assert!(store.needs_reencrypt());
        assert_eq!(store.get_value("LEGACY_KEY", "p").unwrap(), "legacy-secret");

        // Any mutation upgrades the file to the encrypted format.
        store
            .add_key("NEW_KEY", "v", "openai", KeyOptions::default())
            .unwrap();
        assert!(!store.needs_reencrypt());
        let raw = std::fs::read_to_string(data_dir.join(KEYS_FILE)).unwrap();
        assert!(!raw.contains("LEGACY_KEY"));
    }

    #[test]
    fn undecryptable_file_disables_saving_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        // Write the file under one master key...
        {
            let crypto = test_engine(&dir.path().join("machine-a"));
            let store = KeyStore::open(&data_dir, crypto).unwrap();
            store
                .add_key("K", "v", "openai", KeyOptions::default())
                .unwrap();
        }

        // ...and load it under a different one.
        let crypto = test_engine(&dir.path().join("machine-b"));
        let store = KeyStore::open(&data_dir, crypto).unwrap();
        assert!(store.load_failed());
        assert!(store.list_keys(None).is_empty());

        let result = store.add_key("X", "v", "openai", KeyOptions::default());
        assert!(matches!(result, Err(VaultError::StoreLoadFailed)));
        // The rejected mutation was rolled back.
        assert!(store.get_key("X").is_none());

        // The unreadable file is still intact on disk.
        assert!(data_dir.join(KEYS_FILE).exists());

        store.clear_load_failure();
        store
            .add_key("X", "v", "openai", KeyOptions::default())
            .unwrap();
        assert_eq!(store.get_value("X", "p").unwrap(), "v");
    }

    #[test]
    fn stale_temp_file_does_not_affect_committed_state() {
        // Simulates a crash between temp-write and rename: the temp file
        // exists, the committed keys file is untouched.
        let dir = tempfile::tempdir().unwrap();
        let crypto = test_engine(dir.path());
        let data_dir = dir.path().join("data");

        {
            let store = KeyStore::open(&data_dir, Arc::clone(&crypto)).unwrap();
            store
                .add_key("K", "committed", "openai", KeyOptions::default())
                .unwrap();
        }
        let committed = std::fs::read(data_dir.join(KEYS_FILE)).unwrap();

        // The crash left a half-written temp file behind.
        std::fs::write(data_dir.join(KEYS_TEMP_FILE), b"partial garbage").unwrap();

        let store = KeyStore::open(&data_dir, crypto).unwrap();
        assert_eq!(store.get_value("K", "p").unwrap(), "committed");
        assert_eq!(std::fs::read(data_dir.join(KEYS_FILE)).unwrap(), committed);
    }

    #[test]
    fn persistence_failure_rolls_back_memory() {
        let (_dir, store) = test_store();
        store
            .add_key("KEEP", "v1", "openai", KeyOptions::default())
            .unwrap();

        // Make the rename target un-replaceable by turning the keys file
        // path into a directory.
        let keys_file = store.data_dir().join(KEYS_FILE);
        std::fs::remove_file(&keys_file).unwrap();
        std::fs::create_dir(&keys_file).unwrap();

        let result = store.add_key("NEW", "v2", "openai", KeyOptions::default());
        assert!(matches!(result, Err(VaultError::Persistence { .. })));
        assert!(store.get_key("NEW").is_none());
        assert!(store.get_key("KEEP").is_some());

        let result = store.delete_key("KEEP");
        assert!(matches!(result, Err(VaultError::Persistence { .. })));
        assert!(store.get_key("KEEP").is_some());

        let result = store.update_key(
            "KEEP",
            KeyUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(VaultError::Persistence { .. })));
        assert!(store.get_key("KEEP").unwrap().is_active);
    }

    #[test]
    fn batch_retrieval_filters_and_audits() {
        let (_dir, store) = test_store();
        store
            .add_key("OPENAI_KEY", "sk-1", "openai", KeyOptions::default())
            .unwrap();
        store
            .add_key("CLAUDE_KEY", "sk-2", "anthropic", KeyOptions::default())
            .unwrap();
        store
            .add_key("GEMINI_KEY", "sk-3", "gemini", KeyOptions::default())
            .unwrap();

        let by_provider = store
            .keys_for_injection("proj", Some("anthropic"), None)
            .unwrap();
        assert_eq!(by_provider.len(), 1);
        assert_eq!(by_provider["CLAUDE_KEY"], "sk-2");

        let by_names = store
            .keys_for_export(
                "proj",
                None,
                Some(&["OPENAI_KEY".to_string(), "GEMINI_KEY".to_string()]),
            )
            .unwrap();
        assert_eq!(by_names.len(), 2);

        // 3 adds + 1 inject + 2 exports, all signed.
        let report = store.verify_audit_logs().unwrap();
        assert_eq!(report.total, 6);
        assert_eq!(report.verified, 6);
    }

    #[test]
    fn backup_copies_both_files() {
        let (dir, store) = test_store();
        store
            .add_key("K", "v", "openai", KeyOptions::default())
            .unwrap();

        let backup_dir = dir.path().join("backup");
        store.backup(&backup_dir).unwrap();

        assert!(backup_dir.join(KEYS_FILE).exists());
        assert!(backup_dir.join(AUDIT_FILE).exists());
    }
}
