//! AES-256-GCM codec for credential tokens.
//!
//! Every call to [`Codec::encrypt`] draws a fresh 96-bit nonce and embeds it in
//! the envelope, so ciphertext is self-contained: `v1:` + base64(nonce || sealed).

use crate::config::{EncryptionConfig, Environment};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Envelope version prefix. Bumped if the layout ever changes.
const ENVELOPE_PREFIX: &str = "v1:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encryption key must be 32 bytes of base64, got {0} bytes")]
    InvalidKeyLength(usize),

    #[error("encryption key is not valid base64")]
    InvalidKeyEncoding,

    #[error("ciphertext envelope is malformed: {0}")]
    Malformed(&'static str),

    #[error("decryption failed (wrong key, rotated key or tampered data)")]
    Decryption,

    #[error("encryption failed")]
    Encryption,
}

/// Symmetric authenticated codec holding the process-wide key.
///
/// Constructed once at startup and shared by reference; the key never leaves
/// this struct and is not printed by `Debug`.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
    ephemeral: bool,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("key", &"<redacted>")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl Codec {
    /// Builds a codec from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        if key.len() != KEY_SIZE {
            return Err(CodecError::InvalidKeyLength(key.len()));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            ephemeral: false,
        })
    }

    /// Builds a codec from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self, CodecError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|_| CodecError::InvalidKeyEncoding)?;
        Self::new(&key_bytes)
    }

    /// Generates a random in-memory key. Ciphertext produced with it is
    /// unreadable after the process exits.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
            ephemeral: true,
        }
    }

    /// Loads the key from config (inline value first, then the named env var).
    ///
    /// Outside production a missing key falls back to [`Codec::ephemeral`] with
    /// a loud warning; in production it is a startup error.
    pub fn from_config(config: &EncryptionConfig, environment: Environment) -> Result<Self> {
        let configured = config
            .key
            .clone()
            .or_else(|| std::env::var(&config.key_env).ok())
            .filter(|k| !k.trim().is_empty());

        match configured {
            Some(key) => Ok(Self::from_base64(&key)?),
            None if environment == Environment::Production => {
                bail!(
                    "No encryption key configured; set {} or [encryption].key",
                    config.key_env
                )
            }
            None => {
                warn!(
                    key_env = %config.key_env,
                    "NO ENCRYPTION KEY CONFIGURED: using an ephemeral in-memory key. \
                     Credentials stored now become UNREADABLE after a restart."
                );
                Ok(Self::ephemeral())
            }
        }
    }

    /// Generates a fresh base64 key suitable for `CREDGATE_ENCRYPTION_KEY`.
    pub fn generate_key_base64() -> String {
        BASE64.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CodecError::Encryption)?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + sealed.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);

        Ok(format!("{}{}", ENVELOPE_PREFIX, BASE64.encode(envelope)))
    }

    /// Decrypts an envelope produced by [`Codec::encrypt`].
    pub fn decrypt(&self, envelope: &str) -> Result<String, CodecError> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CodecError::Malformed("unknown envelope version"))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CodecError::Malformed("invalid base64"))?;

        // GCM tag is 16 bytes; anything shorter than nonce + tag is garbage
        if bytes.len() < NONCE_SIZE + 16 {
            return Err(CodecError::Malformed("envelope too short"));
        }

        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CodecError::Malformed("plaintext is not UTF-8"))
    }
}
