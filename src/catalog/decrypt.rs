// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Field-level catalog encryption (AES-256-GCM via `ring`).
//!
//! Every field of a catalog item except `id` is stored as an
//! [`EncryptedValue`]:
//!
//! ```json
//! { "encrypted_data": "<b64 ciphertext||tag>", "iv": "<b64 12 bytes>",
//!   "cipher": "aes-256-gcm", "version": 3 }
//! ```
//!
//! The AES key is SHA-256 of the trimmed master secret. The plaintext is
//! `{"json_wrapper": <value>}` so that any JSON value can be stored.

use std::fs;
use std::io;
use std::path::Path;

use base64ct::{Base64, Encoding};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CatalogError, CatalogResult};

/// Cipher name written into every encrypted field.
pub const CIPHER_NAME: &str = "aes-256-gcm";

/// Envelope format version.
pub const FORMAT_VERSION: u32 = 3;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Wrapper key around the plaintext JSON value.
const JSON_WRAPPER: &str = "json_wrapper";

/// One encrypted catalog field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    pub encrypted_data: String,
    pub iv: String,
    pub cipher: String,
    pub version: u32,
}

/// The master secret shared by every node of an environment.
///
/// Holds both the raw secret (an input of history lookup keys) and the
/// derived field key.
#[derive(Clone)]
pub struct MasterKey {
    secret: Vec<u8>,
    field_key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl MasterKey {
    /// Build from raw secret bytes. Surrounding whitespace is ignored.
    pub fn from_secret(secret: &[u8]) -> CatalogResult<Self> {
        let trimmed = secret.trim_ascii();
        if trimmed.is_empty() {
            return Err(CatalogError::EmptyMasterKey);
        }
        let field_key: [u8; 32] = Sha256::digest(trimmed).into();
        Ok(Self {
            secret: trimmed.to_vec(),
            field_key,
        })
    }

    /// Load the master secret from disk.
    pub fn load(path: &Path) -> CatalogResult<Self> {
        tracing::debug!(path = %path.display(), "Loading master key");
        match fs::read(path) {
            Ok(bytes) => Self::from_secret(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CatalogError::MissingMasterKey {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(CatalogError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Raw secret bytes, used when deriving history lookup keys.
    pub fn material(&self) -> &[u8] {
        &self.secret
    }

    fn cipher(&self) -> CatalogResult<LessSafeKey> {
        let unbound = UnboundKey::new(&aead::AES_256_GCM, &self.field_key)
            .map_err(|_| CatalogError::Crypto("invalid field key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt one field value.
    pub fn seal_value(&self, value: &serde_json::Value) -> CatalogResult<EncryptedValue> {
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(JSON_WRAPPER.to_string(), value.clone());
        let mut in_out = serde_json::to_vec(&wrapped)?;

        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| CatalogError::Crypto("rng failure".to_string()))?;

        in_out.reserve(TAG_LEN);
        self.cipher()?
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| CatalogError::Crypto("seal failed".to_string()))?;

        Ok(EncryptedValue {
            encrypted_data: Base64::encode_string(&in_out),
            iv: Base64::encode_string(&nonce),
            cipher: CIPHER_NAME.to_string(),
            version: FORMAT_VERSION,
        })
    }

    /// Decrypt one field value.
    pub fn open_value(&self, field: &EncryptedValue) -> CatalogResult<serde_json::Value> {
        if field.cipher != CIPHER_NAME || field.version != FORMAT_VERSION {
            return Err(CatalogError::UnsupportedFormat {
                cipher: field.cipher.clone(),
                version: field.version,
            });
        }

        let iv = Base64::decode_vec(&field.iv)
            .map_err(|_| CatalogError::Crypto("iv is not base64".to_string()))?;
        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| CatalogError::Crypto("iv has wrong length".to_string()))?;
        let mut in_out = Base64::decode_vec(&field.encrypted_data)
            .map_err(|_| CatalogError::Crypto("ciphertext is not base64".to_string()))?;
        if in_out.len() < TAG_LEN {
            return Err(CatalogError::Crypto("ciphertext too short".to_string()));
        }

        let plain = self
            .cipher()?
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CatalogError::Crypto("decryption failed (wrong master key?)".to_string()))?;

        let mut wrapped: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(plain)?;
        wrapped
            .remove(JSON_WRAPPER)
            .ok_or_else(|| CatalogError::Crypto("plaintext lacks json_wrapper".to_string()))
    }
}
