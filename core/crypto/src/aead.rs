//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::KEY_LENGTH;
use snapvault_common::{codec, Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// An AEAD output: the nonce and the ciphertext (including tag).
///
/// This is the only shape in which keys and items are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "codec::base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// Build from raw parts.
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Length of the plaintext this ciphertext decrypts to.
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Primitive(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| Error::Primitive(format!("Invalid key: {}", e)))
}

/// Encrypt plaintext under a fresh random nonce.
///
/// # Preconditions
/// - `key` must be exactly KEY_LENGTH bytes
///
/// # Postconditions
/// - Returns the nonce and ciphertext separately
/// - `aad` is authenticated but not encrypted
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if encryption fails
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher(key)?
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Primitive(format!("Encryption failed: {}", e)))?;

    Ok(Sealed::new(nonce.to_vec(), ciphertext))
}

/// Decrypt a sealed value.
///
/// # Preconditions
/// - `key` must be exactly KEY_LENGTH bytes
/// - `aad` must match the value given to [`seal`]
///
/// # Errors
/// - Returns error if key or nonce length is incorrect
/// - Returns error if authentication fails (wrong key, tampered data or aad)
pub fn open(key: &[u8], sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.nonce.len() != NONCE_SIZE {
        return Err(Error::Primitive(format!(
            "Invalid nonce length: expected {}, got {}",
            NONCE_SIZE,
            sealed.nonce.len()
        )));
    }
    if sealed.ciphertext.len() < TAG_SIZE {
        return Err(Error::Primitive("Ciphertext too short".to_string()));
    }

    let nonce = XNonce::from_slice(&sealed.nonce);
    cipher(key)?
        .decrypt(
            nonce,
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|e| Error::Primitive(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Hello, World!";

        let sealed = seal(&key, plaintext, b"").unwrap();
        let opened = open(&key, &sealed, b"").unwrap();

        assert_eq!(opened.as_slice(), plaintext);
    }

    #[test]
    fn test_sealed_sizes() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        let sealed = seal(&key, plaintext, b"").unwrap();

        assert_eq!(sealed.nonce.len(), NONCE_SIZE);
        assert_eq!(sealed.ciphertext.len(), plaintext.len() + TAG_SIZE);
        assert_eq!(sealed.plaintext_len(), plaintext.len());
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Same plaintext";

        let s1 = seal(&key, plaintext, b"").unwrap();
        let s2 = seal(&key, plaintext, b"").unwrap();

        assert_ne!(s1.nonce, s2.nonce);
        assert_ne!(s1.ciphertext, s2.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_LENGTH], b"Secret data", b"").unwrap();
        let result = open(&[2u8; KEY_LENGTH], &sealed, b"");

        assert!(matches!(result, Err(Error::Primitive(_))));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [3u8; KEY_LENGTH];
        let sealed = seal(&key, b"bound", b"album-1").unwrap();

        assert!(open(&key, &sealed, b"album-2").is_err());
        assert!(open(&key, &sealed, b"album-1").is_ok());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut sealed = seal(&key, b"Important data", b"").unwrap();
        sealed.ciphertext[5] ^= 0xFF;

        assert!(open(&key, &sealed, b"").is_err());
    }

    #[test]
    fn test_truncated_nonce_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut sealed = seal(&key, b"data", b"").unwrap();
        sealed.nonce.truncate(12);

        assert!(matches!(open(&key, &sealed, b""), Err(Error::Primitive(_))));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(seal(&[0u8; 16], b"data", b"").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_LENGTH];
        let sealed = seal(&key, b"", b"").unwrap();
        let opened = open(&key, &sealed, b"").unwrap();

        assert!(opened.is_empty());
    }

    #[test]
    fn test_sealed_json_shape() {
        let sealed = Sealed::new(vec![0u8; 3], vec![255u8; 3]);
        let json = serde_json::to_string(&sealed).unwrap();
        assert_eq!(json, r#"{"nonce":"AAAA","ciphertext":"////"}"#);
    }
}
