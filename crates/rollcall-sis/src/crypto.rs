//! OAuth token encryption at rest.
//!
//! AES-256-GCM with an HKDF-derived key per integration. Stored values are
//! base64 of `nonce || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Length of AES-256 key in bytes.
const KEY_LENGTH: usize = 32;

/// Length of GCM nonce in bytes.
const NONCE_LENGTH: usize = 12;

/// Length of GCM authentication tag in bytes.
const TAG_LENGTH: usize = 16;

/// Context string for HKDF key derivation.
const HKDF_INFO: &[u8] = b"rollcall-sis-oauth-tokens-v1";

/// Encrypts and decrypts provider tokens.
#[derive(Clone)]
pub struct TokenCipher {
    master_key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCipher {
    #[must_use]
    pub fn new(master_key: [u8; KEY_LENGTH]) -> Self {
        Self { master_key }
    }

    /// Creates a cipher from a hex-encoded 32-byte master key.
    pub fn from_hex(hex_key: &str) -> SyncResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SyncError::Crypto(format!("invalid hex key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Creates a cipher from a base64-encoded 32-byte master key.
    pub fn from_base64(base64_key: &str) -> SyncResult<Self> {
        let bytes = STANDARD
            .decode(base64_key.trim())
            .map_err(|e| SyncError::Crypto(format!("invalid base64 key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Accepts either encoding, trying hex first.
    pub fn from_encoded(key: &str) -> SyncResult<Self> {
        Self::from_hex(key).or_else(|_| Self::from_base64(key))
    }

    fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(SyncError::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self::new(key))
    }

    fn integration_cipher(&self, integration_id: Uuid) -> SyncResult<Aes256Gcm> {
        let hkdf = Hkdf::<Sha256>::new(Some(integration_id.as_bytes()), &self.master_key);
        let mut derived = [0u8; KEY_LENGTH];
        hkdf.expand(HKDF_INFO, &mut derived)
            .map_err(|e| SyncError::Crypto(format!("key derivation failed: {e}")))?;
        Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| SyncError::Crypto(format!("failed to create cipher: {e}")))
    }

    /// Encrypts a token value for an integration.
    pub fn encrypt(&self, integration_id: Uuid, plaintext: &str) -> SyncResult<String> {
        let cipher = self.integration_cipher(integration_id)?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SyncError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypts a stored token value.
    pub fn decrypt(&self, integration_id: Uuid, encoded: &str) -> SyncResult<SecretString> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| SyncError::Crypto(format!("invalid ciphertext encoding: {e}")))?;
        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(SyncError::Crypto("ciphertext too short".to_string()));
        }

        let cipher = self.integration_cipher(integration_id)?;
        let (nonce_bytes, encrypted) = data.split_at(NONCE_LENGTH);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), encrypted)
            .map_err(|e| SyncError::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|e| SyncError::Crypto(format!("decrypted token is not valid UTF-8: {e}")))
    }
}
