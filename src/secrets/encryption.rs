//! AES-256-GCM sealing of secret records.
//!
//! Records are serialized to JSON and sealed with a randomized nonce; the
//! environment name is bound in as associated data so a sealed record cannot
//! be replayed into another environment.

use std::path::Path;

use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, Nonce, RandomizedNonceKey},
    rand::fill,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{SealedPayload, SecretRecord};
use crate::config::Environment;
use crate::error::SecretError;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Holds a sealing key and its identifier.
pub struct SealingKey {
    /// Identifier stored with every sealed record.
    pub id: String,
    key: RandomizedNonceKey,
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A sealed record as stored by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Identifier of the key used for sealing.
    pub key_id: String,
    /// Base64-encoded nonce used during sealing.
    pub nonce: String,
    /// Base64-encoded ciphertext with tag.
    pub value: String,
}

impl SealingKey {
    /// Builds a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidKey`] if the bytes are not a valid
    /// AES-256 key.
    pub fn from_bytes(id: impl Into<String>, bytes: &[u8]) -> Result<Self, SecretError> {
        if bytes.len() != KEY_LEN {
            return Err(SecretError::InvalidKey {
                message: format!("expected {KEY_LEN} bytes, got {}", bytes.len()),
            });
        }
        let key = RandomizedNonceKey::new(&AES_256_GCM, bytes).map_err(|_| SecretError::InvalidKey {
            message: String::from("key rejected by cipher"),
        })?;
        Ok(Self { id: id.into(), key })
    }

    /// Builds a key from base64 text.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidKey`] if the text does not decode to a
    /// 32-byte key.
    pub fn from_base64(id: impl Into<String>, encoded: &SecretString) -> Result<Self, SecretError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| SecretError::InvalidKey {
                message: format!("key is not valid base64: {e}"),
            })?;
        Self::from_bytes(id, &bytes)
    }

    /// Resolves the key from an environment variable, falling back to a key
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidKey`] if neither source yields a key.
    pub fn resolve(id: &str, env_var: &str, key_file: Option<&Path>) -> Result<Self, SecretError> {
        if let Ok(encoded) = std::env::var(env_var) {
            debug!("Using sealing key from ${env_var}");
            return Self::from_base64(id, &SecretString::from(encoded));
        }

        if let Some(path) = key_file {
            debug!("Using sealing key file {}", path.display());
            let encoded = std::fs::read_to_string(path).map_err(|e| SecretError::InvalidKey {
                message: format!("cannot read key file {}: {e}", path.display()),
            })?;
            return Self::from_base64(id, &SecretString::from(encoded));
        }

        Err(SecretError::InvalidKey {
            message: format!("set ${env_var} or configure secrets.key_file (generate one with `rollwarden secret keygen`)"),
        })
    }

    /// Seals a record.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Seal`] if serialization or encryption fails.
    pub fn seal(&self, record: &SecretRecord) -> Result<EncryptedValue, SecretError> {
        let payload = SealedPayload::from(record);
        let mut in_out = serde_json::to_vec(&payload).map_err(|e| SecretError::Seal {
            message: e.to_string(),
        })?;

        let nonce = self
            .key
            .seal_in_place_append_tag(aad(record.environment), &mut in_out)
            .map_err(|_| SecretError::Seal {
                message: String::from("encryption failed"),
            })?;

        Ok(EncryptedValue {
            key_id: self.id.clone(),
            nonce: BASE64_STANDARD.encode(nonce.as_ref()),
            value: BASE64_STANDARD.encode(in_out),
        })
    }

    /// Unseals a record for `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Unseal`] on key mismatch, tampering, or an
    /// environment mismatch.
    pub fn unseal(&self, environment: Environment, sealed: &EncryptedValue) -> Result<SecretRecord, SecretError> {
        let unseal_err = |message: String| SecretError::Unseal { message };

        if sealed.key_id != self.id {
            return Err(unseal_err(format!(
                "record sealed with key '{}', current key is '{}'",
                sealed.key_id, self.id
            )));
        }

        let mut ciphertext = BASE64_STANDARD
            .decode(&sealed.value)
            .map_err(|e| unseal_err(format!("invalid ciphertext encoding: {e}")))?;
        let nonce_bytes = BASE64_STANDARD
            .decode(&sealed.nonce)
            .map_err(|e| unseal_err(format!("invalid nonce encoding: {e}")))?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| unseal_err(String::from("invalid nonce length")))?;

        let plaintext = self
            .key
            .open_in_place(nonce, aad(environment), &mut ciphertext)
            .map_err(|_| unseal_err(String::from("authentication failed")))?;

        let payload: SealedPayload = serde_json::from_slice(plaintext)
            .map_err(|e| unseal_err(format!("invalid payload: {e}")))?;
        if payload.environment() != environment {
            return Err(unseal_err(format!(
                "payload belongs to {}, expected {environment}",
                payload.environment()
            )));
        }
        SecretRecord::try_from(payload)
    }
}

fn aad(environment: Environment) -> Aad<&'static [u8]> {
    Aad::from(environment.as_str().as_bytes())
}

/// Generates a random key, base64 encoded.
///
/// # Errors
///
/// Returns [`SecretError::InvalidKey`] if the system RNG fails.
pub fn generate_key() -> Result<SecretString, SecretError> {
    let mut key_bytes = [0u8; KEY_LEN];
    fill(&mut key_bytes).map_err(|_| SecretError::InvalidKey {
        message: String::from("random number generator failed"),
    })?;
    Ok(SecretString::from(BASE64_STANDARD.encode(key_bytes)))
}
