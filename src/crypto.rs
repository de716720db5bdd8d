//! Credential payload encryption using AES-256-GCM
//!
//! Credential payloads are sealed before they reach `service_credentials`.
//! The additional authenticated data binds each ciphertext to the owning
//! connection and credential version, so a payload copied onto another row
//! fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;

const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("ciphertext sealed with envelope version {found}, expected {expected}")]
    VersionMismatch { found: u8, expected: u8 },
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    /// Generate a random key. Only used by developer profiles without a configured key.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        CryptoKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Envelope encryption of credential payloads.
pub trait SecretProvider: Send + Sync {
    /// Identifier of the key used by [`SecretProvider::seal`].
    fn key_id(&self) -> &str;

    /// Envelope format version written into every ciphertext.
    fn version(&self) -> u8;

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM secret provider with a one-byte version header and random nonce.
#[derive(Clone)]
pub struct AesGcmSecretProvider {
    key: CryptoKey,
    key_id: String,
    version: u8,
}

impl AesGcmSecretProvider {
    pub fn new(key: CryptoKey, key_id: impl Into<String>, version: u8) -> Self {
        Self {
            key,
            key_id: key_id.into(),
            version,
        }
    }

    /// Build the provider from configuration, generating an ephemeral key for
    /// developer profiles that do not configure one.
    pub fn from_config(config: &AppConfig) -> Result<Self, CryptoError> {
        let key = match &config.encryption_key {
            Some(bytes) => CryptoKey::new(bytes.clone())?,
            None => {
                tracing::warn!(
                    profile = %config.profile,
                    "No encryption key configured; using an ephemeral key, stored credentials will not survive a restart"
                );
                CryptoKey::generate()
            }
        };
        Ok(Self::new(
            key,
            config.encryption_key_id.clone(),
            config.encryption_version,
        ))
    }
}

impl std::fmt::Debug for AesGcmSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmSecretProvider")
            .field("key_id", &self.key_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SecretProvider for AesGcmSecretProvider {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn version(&self) -> u8 {
        self.version
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt_bytes(&self.key, self.version, aad, plaintext)
    }

    fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_bytes(&self.key, self.version, aad, ciphertext)
    }
}

/// AAD binding a credential payload to its connection and version.
pub fn credential_aad(connection_id: &str, version: i32) -> Vec<u8> {
    format!("{}|{}", connection_id, version).into_bytes()
}

/// Encrypt bytes using AES-256-GCM, prefixing the envelope version and nonce.
pub fn encrypt_bytes(
    key: &CryptoKey,
    version: u8,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(version);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);
    Ok(result)
}

/// Decrypt bytes produced by [`encrypt_bytes`].
pub fn decrypt_bytes(
    key: &CryptoKey,
    expected_version: u8,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let Some(&found) = ciphertext.first() else {
        return Err(CryptoError::EmptyCiphertext);
    };
    if found != expected_version {
        return Err(CryptoError::VersionMismatch {
            found,
            expected: expected_version,
        });
    }
    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];
    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AesGcmSecretProvider {
        AesGcmSecretProvider::new(CryptoKey::new(vec![7u8; 32]).unwrap(), "local", 1)
    }

    #[test]
    fn seal_open_roundtrip() {
        let provider = provider();
        let aad = credential_aad("conn_1", 1);
        let sealed = provider.seal(b"{\"access_token\":\"t\"}", &aad).unwrap();

        assert_eq!(sealed[0], 1);
        assert_ne!(&sealed[VERSION_FIELD_LEN + NONCE_LEN..], b"{\"access_token\":\"t\"}");
        assert_eq!(
            provider.open(&sealed, &aad).unwrap(),
            b"{\"access_token\":\"t\"}"
        );
    }

    #[test]
    fn payload_moved_to_another_row_fails() {
        let provider = provider();
        let sealed = provider.seal(b"secret", &credential_aad("conn_1", 1)).unwrap();

        assert!(matches!(
            provider.open(&sealed, &credential_aad("conn_1", 2)),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert!(provider.open(&sealed, &credential_aad("conn_2", 1)).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let provider = provider();
        let aad = credential_aad("conn_1", 1);
        let mut sealed = provider.seal(b"secret", &aad).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(provider.open(&sealed, &aad).is_err());
    }

    #[test]
    fn nonces_are_unique() {
        let provider = provider();
        let aad = credential_aad("conn_1", 1);
        let first = provider.seal(b"same", &aad).unwrap();
        let second = provider.seal(b"same", &aad).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn rejects_unknown_envelope_version() {
        let provider = provider();
        let aad = credential_aad("conn_1", 1);
        let mut sealed = provider.seal(b"secret", &aad).unwrap();
        sealed[0] = 9;

        assert!(matches!(
            provider.open(&sealed, &aad),
            Err(CryptoError::VersionMismatch { found: 9, expected: 1 })
        ));
    }

    #[test]
    fn rejects_short_and_empty_ciphertexts() {
        let provider = provider();
        assert!(matches!(
            provider.open(&[], b"aad"),
            Err(CryptoError::EmptyCiphertext)
        ));
        assert!(matches!(
            provider.open(&[1, 2, 3], b"aad"),
            Err(CryptoError::InvalidFormat)
        ));
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn dev_profile_without_key_gets_ephemeral_key() {
        let config = AppConfig::default();
        let provider = AesGcmSecretProvider::from_config(&config).unwrap();
        assert_eq!(provider.key_id(), "local");
        let sealed = provider.seal(b"x", b"aad").unwrap();
        assert_eq!(provider.open(&sealed, b"aad").unwrap(), b"x");
    }
}
