//! At-rest encryption of designated document fields.
//!
//! The key is derived from the store passphrase with Argon2id and a random
//! per-store salt. Each field value is serialized to JSON, sealed with
//! XChaCha20-Poly1305 under a fresh nonce, and stored as the string
//! `enc:v1:<base64(nonce || ciphertext)>`.
//!
//! A small known plaintext (the verifier) is sealed when the store is
//! created, so a wrong passphrase is detected at open time instead of on the
//! first read of an encrypted field.

use crate::{error::Result, Error};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const PREFIX: &str = "enc:v1:";
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const VERIFIER_PLAINTEXT: &str = "ferry-verifier";

/// Encryption parameters persisted in the store header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionHeader {
    /// Base64 Argon2 salt
    pub salt: String,
    /// Sealed verifier, same format as an encrypted field
    pub verifier: String,
}

/// Seals and opens field values with a passphrase-derived key.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldCipher(..)")
    }
}

impl FieldCipher {
    /// Derive a fresh key for a new store and the header that goes with it.
    pub fn create(password: &str) -> Result<(Self, EncryptionHeader)> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let cipher = Self::derive(password, &salt)?;
        let verifier = cipher.seal(&Value::String(VERIFIER_PLAINTEXT.into()))?;
        let header = EncryptionHeader {
            salt: BASE64.encode(salt),
            verifier,
        };
        Ok((cipher, header))
    }

    /// Re-derive the key of an existing store, failing with
    /// [`Error::CredentialMismatch`] if the passphrase is wrong.
    pub fn unlock(password: &str, header: &EncryptionHeader) -> Result<Self> {
        let salt = BASE64
            .decode(&header.salt)
            .map_err(|e| Error::Encryption(format!("bad salt: {e}")))?;
        let cipher = Self::derive(password, &salt)?;
        match cipher.open(&header.verifier) {
            Ok(Value::String(s)) if s == VERIFIER_PLAINTEXT => Ok(cipher),
            _ => Err(Error::CredentialMismatch(
                "passphrase does not match the existing store".into(),
            )),
        }
    }

    fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|e| Error::Encryption(format!("key derivation failed: {e}")))?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Seal one JSON value.
    pub fn seal(&self, value: &Value) -> Result<String> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| Error::Encryption(e.to_string()))?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| Error::Encryption("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", BASE64.encode(out)))
    }

    /// Open a value produced by [`FieldCipher::seal`].
    pub fn open(&self, sealed: &str) -> Result<Value> {
        let encoded = sealed
            .strip_prefix(PREFIX)
            .ok_or_else(|| Error::Encryption("value is not encrypted".into()))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Encryption(format!("bad ciphertext encoding: {e}")))?;
        if bytes.len() < NONCE_LEN {
            return Err(Error::Encryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::CredentialMismatch("field cannot be decrypted".into()))?;
        serde_json::from_slice(&plaintext).map_err(|e| Error::Encryption(e.to_string()))
    }

    /// Seal the named fields in place. Missing and null fields are left alone.
    pub fn seal_fields(&self, fields: &mut Map<String, Value>, names: &[String]) -> Result<()> {
        for name in names {
            if let Some(value) = fields.get_mut(name) {
                if value.is_null() {
                    continue;
                }
                *value = Value::String(self.seal(value)?);
            }
        }
        Ok(())
    }

    /// Open the named fields in place.
    pub fn open_fields(&self, fields: &mut Map<String, Value>, names: &[String]) -> Result<()> {
        for name in names {
            if let Some(value) = fields.get_mut(name) {
                if let Some(sealed) = value.as_str().filter(|s| is_sealed(s)) {
                    *value = self.open(sealed)?;
                }
            }
        }
        Ok(())
    }
}

/// Whether a stored string is an encrypted field value.
pub fn is_sealed(value: &str) -> bool {
    value.starts_with(PREFIX)
}
