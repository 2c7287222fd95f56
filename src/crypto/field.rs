//! Encrypted string fields.
//!
//! A field is sealed with AES-256-GCM and stored as base64 text:
//!
//! ```text
//! base64( format(1) | key_id(1) | nonce(12) | ciphertext+tag )
//! ```
//!
//! The two header bytes are authenticated as associated data. `key_id`
//! names the key a value was sealed under; today every store uses a single
//! key, and a ciphertext tagged with another id is refused up front.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use super::aes::{self, SecureKey, NONCE_SIZE};

/// Current ciphertext layout.
pub const FORMAT_V1: u8 = 1;

const HEADER_LEN: usize = 2;
const TAG_LEN: usize = 16;

/// Errors produced by the field codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("key material too short: {len} bytes, need at least {min}")]
    KeyTooShort { len: usize, min: usize },

    #[error("malformed ciphertext: {0}")]
    Malformed(&'static str),

    #[error("ciphertext sealed under key {found}, expected key {expected}")]
    KeyMismatch { expected: u8, found: u8 },

    #[error("decryption failed: wrong key or corrupted ciphertext")]
    Decryption,

    #[error("encryption failed")]
    Encryption,

    #[error("decrypted field is not valid UTF-8")]
    InvalidUtf8,
}

/// A validated field-encryption key and the id it tags ciphertexts with.
pub struct FieldKey {
    id: u8,
    key: SecureKey,
}

impl FieldKey {
    /// Validates and normalizes `material` as key id 0.
    pub fn new(material: &[u8]) -> Result<Self, CodecError> {
        Self::with_id(0, material)
    }

    /// Validates and normalizes `material` under an explicit key id.
    pub fn with_id(id: u8, material: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            id,
            key: SecureKey::derive(material)?,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }
}

impl std::fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Seals `plaintext` under `key`.
pub fn encrypt_field(plaintext: &str, key: &FieldKey) -> Result<String, CodecError> {
    let header = [FORMAT_V1, key.id];
    let (ciphertext, nonce) = aes::encrypt(&key.key, plaintext.as_bytes(), &header)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&header);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(blob))
}

/// Opens a value produced by [`encrypt_field`].
pub fn decrypt_field(ciphertext: &str, key: &FieldKey) -> Result<String, CodecError> {
    let blob = STANDARD
        .decode(ciphertext)
        .map_err(|_| CodecError::Malformed("not base64"))?;

    if blob.len() < HEADER_LEN + NONCE_SIZE + TAG_LEN {
        return Err(CodecError::Malformed("too short"));
    }

    let (header, rest) = blob.split_at(HEADER_LEN);
    if header[0] != FORMAT_V1 {
        return Err(CodecError::Malformed("unknown format"));
    }
    if header[1] != key.id {
        return Err(CodecError::KeyMismatch {
            expected: key.id,
            found: header[1],
        });
    }

    let (nonce, sealed) = rest.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| CodecError::Malformed("bad nonce"))?;

    let plaintext = aes::decrypt(&key.key, sealed, &nonce, header)?;
    String::from_utf8(plaintext).map_err(|_| CodecError::InvalidUtf8)
}

/// Reads the key id a ciphertext was sealed under without decrypting it.
pub fn sealed_key_id(ciphertext: &str) -> Result<u8, CodecError> {
    let blob = STANDARD
        .decode(ciphertext)
        .map_err(|_| CodecError::Malformed("not base64"))?;
    match blob.as_slice() {
        [FORMAT_V1, key_id, ..] => Ok(*key_id),
        [_, _, ..] => Err(CodecError::Malformed("unknown format")),
        _ => Err(CodecError::Malformed("too short")),
    }
}
