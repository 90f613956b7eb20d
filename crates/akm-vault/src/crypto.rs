//! AES-256-GCM encryption engine and master-key lifecycle.
//!
//! [`CryptoEngine`] owns the single master key protecting every stored
//! secret:
//!
//! - **Encryption/decryption**: AES-256-GCM with a randomly generated 96-bit
//!   nonce per call.  Tokens are self-describing: a version byte and the
//!   nonce travel with the ciphertext, so a token can be decrypted without
//!   any external context.
//! - **Signing**: HMAC-SHA256 over arbitrary messages, verified in constant
//!   time.  Used for the tamper-evident audit trail.
//! - **Lifecycle**: the master key is loaded from (or generated into) a
//!   platform keychain on [`CryptoEngine::initialize`], and can be exported,
//!   imported, or reset.
//!
//! # Security Notes
//!
//! - Nonces are generated randomly for each encryption; with 96-bit nonces
//!   the collision probability is negligible for up to ~2^32 encryptions
//!   under one key.
//! - An exported master key is equivalent in power to the plaintext of every
//!   stored secret.  Resetting the master key makes all existing ciphertext
//!   permanently undecryptable.

use std::sync::{PoisonError, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::hmac;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, VaultError};
use crate::keychain::KeychainProvider;

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the PBKDF2 salt in bytes (file-keychain device key).
pub const SALT_LEN: usize = 32;

/// Version byte prepended to every encrypted token.
const TOKEN_VERSION: u8 = 1;

/// Minimum token size: version (1) + nonce (12) + GCM tag (16).
const MIN_TOKEN_LEN: usize = 1 + NONCE_LEN_BYTES + 16;

/// PBKDF2 iteration count for the device-derived keychain key — 600,000 per
/// OWASP 2023 recommendation for HMAC-SHA256.
const PBKDF2_ITERATIONS: u32 = 600_000;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations.  Since a fresh
/// random nonce is generated per encryption call, this wrapper ensures each
/// sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Raw seal/open (used by the engine and the file keychain)
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key`, returning `nonce ‖ ciphertext+tag`.
pub(crate) fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;
    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    // `ring` encrypts in place and appends the authentication tag.
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    let mut blob = Vec::with_capacity(NONCE_LEN_BYTES + in_out.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&in_out);
    Ok(blob)
}

/// Decrypt a `nonce ‖ ciphertext+tag` blob produced by [`seal`].
pub(crate) fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN_BYTES + 16 {
        return Err(VaultError::Integrity {
            reason: "ciphertext too short".into(),
        });
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_bytes);

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::Integrity {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::Integrity {
            reason: "authentication failed — wrong key or corrupted data".into(),
        })?;

    Ok(plaintext.to_vec())
}

/// Derive a 256-bit key from `secret` and a known `salt` via
/// PBKDF2-HMAC-SHA256.  Used by the file keychain to build its
/// device-derived key.
pub(crate) fn derive_key_with_salt(secret: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    let iterations =
        std::num::NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, secret, out);
}

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random bytes".into(),
        })?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The authenticated-encryption engine.
///
/// Encrypt/decrypt/sign take a read lock on the master key, so routine
/// crypto runs concurrently; initialize/import/reset take the write lock and
/// exclude all other key access.
pub struct CryptoEngine {
    keychain: Box<dyn KeychainProvider>,
    master_key: RwLock<Option<[u8; KEY_LEN]>>,
}

impl CryptoEngine {
    /// Create an engine backed by the given keychain.  No key is loaded
    /// until [`initialize`](Self::initialize) is called.
    pub fn new(keychain: Box<dyn KeychainProvider>) -> Self {
        Self {
            keychain,
            master_key: RwLock::new(None),
        }
    }

    /// Load the master key from the keychain, or generate and store a fresh
    /// one on first run.
    pub fn initialize(&self) -> Result<()> {
        let mut guard = self
            .master_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match self.keychain.get_master_key() {
            Ok(bytes) => {
                *guard = Some(key_from_bytes(&bytes)?);
                tracing::debug!("loaded master key from keychain");
                Ok(())
            }
            Err(VaultError::MasterKeyNotFound) => {
                let fresh = random_bytes(KEY_LEN)?;
                self.keychain.set_master_key(&fresh)?;
                *guard = Some(key_from_bytes(&fresh)?);
                tracing::info!("generated new master key and stored it in the keychain");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a master key is currently loaded.
    pub fn is_initialized(&self) -> bool {
        self.master_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn with_key<T>(&self, f: impl FnOnce(&[u8; KEY_LEN]) -> Result<T>) -> Result<T> {
        let guard = self
            .master_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let key = guard.as_ref().ok_or(VaultError::NotInitialized)?;
        f(key)
    }

    /// Encrypt `plaintext` into a base64 token.
    ///
    /// Tokens are non-deterministic (fresh random nonce per call) and
    /// self-describing: `base64(version ‖ nonce ‖ ciphertext+tag)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        self.with_key(|key| {
            let sealed = seal(key, plaintext)?;
            let mut token = Vec::with_capacity(1 + sealed.len());
            token.push(TOKEN_VERSION);
            token.extend_from_slice(&sealed);

            tracing::trace!(
                plaintext_len = plaintext.len(),
                token_len = token.len(),
                "encrypted data"
            );
            Ok(BASE64.encode(token))
        })
    }

    /// Decrypt a base64 token produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Integrity`] on MAC mismatch, wrong key, or a
    /// malformed token — never partial or corrupted output.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>> {
        self.with_key(|key| {
            let raw = BASE64.decode(token).map_err(|_| VaultError::Integrity {
                reason: "token is not valid base64".into(),
            })?;
            if raw.len() < MIN_TOKEN_LEN {
                return Err(VaultError::Integrity {
                    reason: "token too short".into(),
                });
            }
            if raw[0] != TOKEN_VERSION {
                return Err(VaultError::Integrity {
                    reason: format!("unsupported token version {}", raw[0]),
                });
            }
            open(key, &raw[1..])
        })
    }

    /// Decrypt a token into a UTF-8 string.
    pub fn decrypt_string(&self, token: &str) -> Result<String> {
        let bytes = self.decrypt(token)?;
        String::from_utf8(bytes).map_err(|_| VaultError::Integrity {
            reason: "decrypted payload is not valid UTF-8".into(),
        })
    }

    /// Sign `message` with HMAC-SHA256, returning the hex-encoded MAC.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        self.with_key(|key| {
            let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
            let tag = hmac::sign(&hmac_key, message);
            Ok(hex::encode(tag.as_ref()))
        })
    }

    /// Verify a hex-encoded HMAC-SHA256 signature in constant time.
    ///
    /// Returns `Ok(false)` for a malformed or mismatching signature; only
    /// engine-level failures (no master key) surface as errors.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<bool> {
        self.with_key(|key| {
            let Ok(sig_bytes) = hex::decode(signature) else {
                return Ok(false);
            };
            let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
            Ok(hmac::verify(&hmac_key, message, &sig_bytes).is_ok())
        })
    }

    /// Export the master key as base64.
    ///
    /// The exported string is equivalent in power to the plaintext of every
    /// stored secret — handle accordingly.
    pub fn export_master_key(&self) -> Result<String> {
        self.with_key(|key| Ok(BASE64.encode(key)))
    }

    /// Import a previously exported master key, overwriting the keychain
    /// entry and the in-memory key.
    pub fn import_master_key(&self, encoded: &str) -> Result<()> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| VaultError::Integrity {
                reason: "master key is not valid base64".into(),
            })?;
        let key = key_from_bytes(&bytes)?;

        let mut guard = self
            .master_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.keychain.set_master_key(&bytes)?;
        *guard = Some(key);

        tracing::info!("imported master key into keychain");
        Ok(())
    }

    /// Delete the master key from the keychain and clear it from memory.
    ///
    /// All existing ciphertext becomes permanently undecryptable.
    pub fn reset_master_key(&self) -> Result<()> {
        let mut guard = self
            .master_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.keychain.delete_master_key()?;
        *guard = None;

        tracing::warn!("master key deleted — existing ciphertext is now undecryptable");
        Ok(())
    }
}

fn key_from_bytes(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::Integrity {
        reason: format!("master key must be {} bytes, got {}", KEY_LEN, bytes.len()),
    })?;
    Ok(arr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
