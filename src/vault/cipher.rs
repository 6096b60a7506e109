//! Field encryption for token records.
//!
//! Some token fields hold third-party secrets (OAuth tokens, passwords) or the parent's secret.
//! They are stored as base64 ChaCha20 ciphertext keyed by the token's own secret, which the
//! database never sees. No MAC is applied: this protects a stolen copy of the data at rest, not
//! a database an attacker can write to.
//!
//! Nonces are static, one per field:
//!
//! | nonce | fields |
//! |-------|--------|
//! | 0     | `parentTokenKey`, `frontendRef.http.auth.bearer`, `frontendRef.http.auth.basic.password`, `frontendRef.http.auth.refresh` |
//!
//! Reusing nonce 0 is sound only because these fields are written once at creation and at most
//! one of them is present on any record. A new encrypted field needs its own nonce unless the
//! same holds for it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use zeroize::Zeroize;

use super::TokenSecret;
use crate::errors::{AuthzError, AuthzResult};

/// Passwords are NUL-padded to this length before encryption to hide short lengths.
pub const PASSWORD_PAD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldNonce {
    Zero,
}

impl FieldNonce {
    fn bytes(self) -> [u8; 12] {
        match self {
            FieldNonce::Zero => [0u8; 12],
        }
    }
}

fn apply(secret: &TokenSecret, nonce: FieldNonce, data: &mut [u8]) {
    let nonce = nonce.bytes();
    let mut cipher = ChaCha20::new(
        Key::from_slice(secret.key_bytes()),
        Nonce::from_slice(&nonce),
    );
    cipher.apply_keystream(data);
}

/// Encrypts `plaintext` and returns base64 ciphertext.
pub fn encrypt_field(secret: &TokenSecret, nonce: FieldNonce, plaintext: &[u8]) -> String {
    let mut buf = plaintext.to_vec();
    apply(secret, nonce, &mut buf);
    let out = STANDARD.encode(&buf);
    buf.zeroize();
    out
}

/// Inverse of [`encrypt_field`]. A wrong secret produces garbage, not an error; only malformed
/// base64 is rejected.
pub fn decrypt_field(secret: &TokenSecret, nonce: FieldNonce, ciphertext: &str) -> AuthzResult<Vec<u8>> {
    let mut buf = STANDARD
        .decode(ciphertext)
        .map_err(|e| AuthzError::invariant(format!("encrypted field is not base64: {}", e)))?;
    apply(secret, nonce, &mut buf);
    Ok(buf)
}

pub fn encrypt_str(secret: &TokenSecret, nonce: FieldNonce, plaintext: &str) -> String {
    encrypt_field(secret, nonce, plaintext.as_bytes())
}

pub fn decrypt_str(secret: &TokenSecret, nonce: FieldNonce, ciphertext: &str) -> AuthzResult<String> {
    let bytes = decrypt_field(secret, nonce, ciphertext)?;
    String::from_utf8(bytes).map_err(|_| AuthzError::invariant("decrypted field is not UTF-8"))
}

/// Pads with NUL up to [`PASSWORD_PAD_LEN`] and encrypts. Longer passwords are not truncated.
pub fn encrypt_password(secret: &TokenSecret, password: &str) -> String {
    let mut padded = password.as_bytes().to_vec();
    if padded.len() < PASSWORD_PAD_LEN {
        padded.resize(PASSWORD_PAD_LEN, 0);
    }
    let out = encrypt_field(secret, FieldNonce::Zero, &padded);
    padded.zeroize();
    out
}

pub fn decrypt_password(secret: &TokenSecret, ciphertext: &str) -> AuthzResult<String> {
    let mut bytes = decrypt_field(secret, FieldNonce::Zero, ciphertext)?;
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|_| AuthzError::invariant("decrypted password is not UTF-8"))
}

// ── Tests ──────────────────────────────────────────────────────
