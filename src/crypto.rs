//! # Frame Encryption
//!
//! Agent traffic is optionally wrapped in AES-GCM using a key derived from
//! the node's secret: `key = SHA-256(secret)`, a fresh random 12-byte nonce
//! per message, no additional associated data. Replay protection is out of
//! scope — agents are trusted up to their secret (§9).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret required")]
    MissingSecret,
    #[error("plaintext required")]
    EmptyPlaintext,
    #[error("ciphertext too short")]
    ShortCiphertext,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cipher error")]
    Cipher,
}

fn key_from_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Encrypts `plain` under `secret`'s derived key, returning the
/// base64(iv || ciphertext || tag) wire representation.
pub fn encrypt(secret: &str, plain: &[u8]) -> Result<String, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::MissingSecret);
    }
    if plain.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }

    let key = key_from_secret(secret);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Cipher)?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plain)
        .map_err(|_| CryptoError::Cipher)?;

    let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

/// Decrypts a base64(iv || ciphertext || tag) payload produced by [`encrypt`].
pub fn decrypt(secret: &str, encrypted: &str) -> Result<Vec<u8>, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::MissingSecret);
    }

    let data = STANDARD.decode(encrypted)?;
    if data.len() < IV_LEN {
        return Err(CryptoError::ShortCiphertext);
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let key = key_from_secret(secret);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Cipher)?;
    let nonce = Nonce::from_slice(iv);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Cipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let secret = "node-secret-abc";
        let plain = br#"{"hello":"world"}"#;
        let enc = encrypt(secret, plain).unwrap();
        let dec = decrypt(secret, &enc).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn wrong_secret_fails() {
        let enc = encrypt("secret-a", b"payload").unwrap();
        assert!(decrypt("secret-b", &enc).is_err());
    }

    #[test]
    fn empty_plaintext_rejected() {
        assert!(matches!(
            encrypt("secret", b""),
            Err(CryptoError::EmptyPlaintext)
        ));
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(matches!(
            encrypt("", b"data"),
            Err(CryptoError::MissingSecret)
        ));
    }
}
