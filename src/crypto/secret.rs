//! API key secrets.
//!
//! A client is handed `rsk_<id>.<secret>` once, at issuance. Only the
//! SHA-256 hex digest of the secret is persisted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Prefix of every presented API key.
pub const API_KEY_PREFIX: &str = "rsk_";

const SECRET_BYTES: usize = 32;

/// A freshly minted API key. `secret` must be shown to the owner once and
/// then dropped.
pub struct GeneratedApiKey {
    pub id: String,
    pub secret: Zeroizing<String>,
    pub hash: String,
}

impl GeneratedApiKey {
    /// The full credential string handed to the client.
    pub fn presented(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{API_KEY_PREFIX}{}.{}", self.id, self.secret.as_str()))
    }
}

impl std::fmt::Debug for GeneratedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedApiKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("hash", &self.hash)
            .finish()
    }
}

/// Mints a new key id and secret.
pub fn generate_api_key() -> GeneratedApiKey {
    let mut bytes = Zeroizing::new([0u8; SECRET_BYTES]);
    OsRng.fill_bytes(&mut bytes[..]);

    let secret = Zeroizing::new(URL_SAFE_NO_PAD.encode(&bytes[..]));
    let hash = hash_secret(&secret);

    GeneratedApiKey {
        id: Uuid::new_v4().simple().to_string(),
        secret,
        hash,
    }
}

/// One-way hash stored in `api_keys.key_hash`.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Compares `secret` against a stored hash in constant time.
pub fn verify_secret(secret: &str, expected_hash: &str) -> bool {
    let actual = hash_secret(secret);
    actual.as_bytes().ct_eq(expected_hash.as_bytes()).into()
}

/// Splits a presented `rsk_<id>.<secret>` credential.
pub fn parse_presented(token: &str) -> Option<(&str, &str)> {
    let (id, secret) = token.strip_prefix(API_KEY_PREFIX)?.split_once('.')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id, secret))
}
