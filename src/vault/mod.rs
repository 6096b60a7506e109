//! Token secrets and the hashes derived from them.
//!
//! A secret is 32 random bytes, rendered base64url without padding. It is handed to the caller
//! exactly once and never persisted: the token record is keyed by `hash_token(secret)`, and the
//! secret's bytes double as the key for the record's encrypted fields (see [`cipher`]).

pub mod cipher;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SECRET_LEN: usize = 32;

/// A live capability secret. Zeroed on drop; `Debug` never prints it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TokenSecret {
    text: String,
    key: [u8; SECRET_LEN],
}

impl TokenSecret {
    pub fn generate() -> Self {
        let mut key = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let text = URL_SAFE_NO_PAD.encode(key);
        Self { text, key }
    }

    /// Parses a presented secret. Anything that is not 32 bytes of base64url yields `None`; the
    /// caller reports that exactly like an unknown token.
    pub fn parse(text: &str) -> Option<Self> {
        let mut bytes = URL_SAFE_NO_PAD.decode(text.trim_end_matches('=')).ok()?;
        if bytes.len() != SECRET_LEN {
            bytes.zeroize();
            return None;
        }
        let mut key = [0u8; SECRET_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Some(Self {
            text: text.to_string(),
            key,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn key_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.key
    }

    /// The `_id` of the token record this secret unlocks.
    pub fn token_id(&self) -> String {
        hash_token(&self.text)
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSecret(****)")
    }
}

/// base64(SHA-256(secret)).
pub fn hash_token(secret: &str) -> String {
    STANDARD.encode(Sha256::digest(secret.as_bytes()))
}

/// `_id` of the ApiHost document for a token: the first 32 hex chars of SHA-256("x" + secret).
/// The prefix keeps it unrelated to the token id.
pub fn api_host_id(secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(b"x");
    h.update(secret.as_bytes());
    let mut id = hex::encode(h.finalize());
    id.truncate(32);
    id
}

/// `hash2` of an ApiHost document: base64(SHA-256(tokenId)). Lets the host be found from the
/// token id alone when the token is deleted.
pub fn api_host_hash2(token_id: &str) -> String {
    STANDARD.encode(Sha256::digest(token_id.as_bytes()))
}

/// Random 128-bit identifier in hex, used for accounts and grain-local identities.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// hex(SHA-256(service + ":" + serviceUserId)).
pub fn credential_id(service: &str, service_user_id: &str) -> String {
    hex::encode(Sha256::digest(format!("{}:{}", service, service_user_id).as_bytes()))
}
