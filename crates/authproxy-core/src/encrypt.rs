// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption for connector definitions and secrets.
//!
//! [`EncryptService`] is the seam the rest of the crate encrypts through.
//! [`AesGcmEncryptService`] is the default implementation: AES-256-GCM with a
//! per-context key derived as `HMAC-SHA256(master_key, context)`. Ciphertexts
//! are `base64(nonce || ciphertext || tag)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::connector::ConnectorVersionId;
use crate::error::{CoreError, Result};

/// Length of the AES-256 master key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of the GCM nonce in bytes.
const NONCE_LENGTH: usize = 12;

/// Encryption operations used by the connector and connection layers.
#[async_trait]
pub trait EncryptService: Send + Sync {
    /// Encrypt a string bound to one connector version.
    async fn encrypt_string_for_connector(
        &self,
        cv: ConnectorVersionId,
        plaintext: &str,
    ) -> Result<String>;

    /// Decrypt a string previously encrypted for the same connector version.
    async fn decrypt_string_for_connector(
        &self,
        cv: ConnectorVersionId,
        ciphertext: &str,
    ) -> Result<String>;

    /// Encrypt a string scoped to a namespace.
    async fn encrypt_string_for_namespace(&self, namespace: &str, plaintext: &str)
    -> Result<String>;

    /// Decrypt a string previously encrypted for the same namespace.
    async fn decrypt_string_for_namespace(
        &self,
        namespace: &str,
        ciphertext: &str,
    ) -> Result<String>;
}

/// AES-256-GCM encryption with HMAC-derived per-context keys.
#[derive(Clone)]
pub struct AesGcmEncryptService {
    master_key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl AesGcmEncryptService {
    /// Create a new encryption service from a raw master key.
    pub fn new(master_key: [u8; KEY_LENGTH]) -> Self {
        Self {
            master_key: Zeroizing::new(master_key),
        }
    }

    /// Create a new encryption service from a base64-encoded master key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CoreError::Encryption(format!("invalid base64 key: {}", e)))?,
        );

        if bytes.len() != KEY_LENGTH {
            return Err(CoreError::Encryption(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key))
    }

    fn derive_key(&self, context: &str) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.master_key[..])
            .map_err(|e| CoreError::Encryption(format!("failed to init key derivation: {}", e)))?;
        mac.update(context.as_bytes());
        let derived = mac.finalize().into_bytes();

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&derived);
        Ok(key)
    }

    fn encrypt(&self, context: &str, plaintext: &str) -> Result<String> {
        let key = self.derive_key(context)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CoreError::Encryption(format!("failed to create cipher: {}", e)))?;

        let nonce_bytes: [u8; NONCE_LENGTH] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CoreError::Encryption(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, context: &str, encoded: &str) -> Result<String> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| CoreError::Encryption(format!("invalid ciphertext encoding: {}", e)))?;

        if data.len() <= NONCE_LENGTH {
            return Err(CoreError::Encryption("ciphertext too short".to_string()));
        }

        let key = self.derive_key(context)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CoreError::Encryption(format!("failed to create cipher: {}", e)))?;

        let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::Encryption("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CoreError::Encryption(format!("plaintext is not UTF-8: {}", e)))
    }
}

fn connector_context(cv: ConnectorVersionId) -> String {
    format!("connector:{}:{}", cv.id, cv.version)
}

fn namespace_context(namespace: &str) -> String {
    format!("namespace:{}", namespace)
}

#[async_trait]
impl EncryptService for AesGcmEncryptService {
    async fn encrypt_string_for_connector(
        &self,
        cv: ConnectorVersionId,
        plaintext: &str,
    ) -> Result<String> {
        self.encrypt(&connector_context(cv), plaintext)
    }

    async fn decrypt_string_for_connector(
        &self,
        cv: ConnectorVersionId,
        ciphertext: &str,
    ) -> Result<String> {
        self.decrypt(&connector_context(cv), ciphertext)
    }

    async fn encrypt_string_for_namespace(
        &self,
        namespace: &str,
        plaintext: &str,
    ) -> Result<String> {
        self.encrypt(&namespace_context(namespace), plaintext)
    }

    async fn decrypt_string_for_namespace(
        &self,
        namespace: &str,
        ciphertext: &str,
    ) -> Result<String> {
        self.decrypt(&namespace_context(namespace), ciphertext)
    }
}
