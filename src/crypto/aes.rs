use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use aes_gcm::aead::rand_core::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::field::CodecError;

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The shortest key material accepted by [`SecureKey::derive`].
pub const MIN_KEY_MATERIAL: usize = 16;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Normalizes caller-supplied key material into an AES-256 key.
    ///
    /// Exactly 32 bytes are used verbatim. Any other length of at least
    /// [`MIN_KEY_MATERIAL`] bytes is condensed with SHA-256. Shorter material
    /// is rejected here, before it can reach the cipher.
    pub fn derive(material: &[u8]) -> Result<Self, CodecError> {
        if material.len() < MIN_KEY_MATERIAL {
            return Err(CodecError::KeyTooShort {
                len: material.len(),
                min: MIN_KEY_MATERIAL,
            });
        }

        let mut key = [0u8; KEY_SIZE];
        if material.len() == KEY_SIZE {
            key.copy_from_slice(material);
        } else {
            key.copy_from_slice(&Sha256::digest(material));
        }
        Ok(Self(key))
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Generates a new random AES-GCM nonce.
///
/// # Returns
///
/// A 12-byte array representing the nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts a plaintext using AES-256-GCM.
///
/// # Arguments
///
/// * `key` - The AES-256 key.
/// * `plaintext` - The data to encrypt.
/// * `aad` - Associated data authenticated alongside the ciphertext.
///
/// # Returns
///
/// A tuple containing the ciphertext and the nonce used for encryption.
pub fn encrypt(
    key: &SecureKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CodecError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CodecError::Encryption)?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypts a ciphertext using AES-256-GCM.
///
/// Fails with [`CodecError::Decryption`] when the key is wrong or the
/// ciphertext, nonce or associated data were altered.
pub fn decrypt(
    key: &SecureKey,
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(*nonce);

    cipher
        .decrypt(&nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CodecError::Decryption)
}
