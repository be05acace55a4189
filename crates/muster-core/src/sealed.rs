//! Sealed envelope — the symmetric-cipher JSON codec used for identity and
//! credential payloads during the join handshake.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce prepended to the ciphertext.
//! The key is derived from the fleet-wide shared secret with BLAKE3, so both
//! sides only ever configure a passphrase-like string.
//!
//! Undecryptable or schema-invalid input is always a client error — the
//! caller maps it to a non-retryable rejection.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SealedError {
    #[error("payload too short to carry a nonce")]
    TooShort,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("invalid payload schema: {0}")]
    Schema(#[from] serde_json::Error),
}

/// Derive the 256-bit envelope key from the configured shared secret.
pub fn derive_key(shared_secret: &str) -> [u8; 32] {
    *blake3::hash(shared_secret.as_bytes()).as_bytes()
}

/// Serialize `value` as JSON and encrypt it. Output: nonce || ciphertext.
pub fn seal<T: Serialize>(key: &[u8; 32], value: &T) -> Result<Vec<u8>, SealedError> {
    let plaintext = serde_json::to_vec(value)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| SealedError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt and deserialize a payload produced by [`seal`].
pub fn open<T: DeserializeOwned>(key: &[u8; 32], payload: &[u8]) -> Result<T, SealedError> {
    if payload.len() < NONCE_LEN {
        return Err(SealedError::TooShort);
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealedError::Decrypt)?;

    Ok(serde_json::from_slice(&plaintext)?)
}
