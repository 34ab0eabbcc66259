//! Asymmetric key wrapping for sharing collection keys.
//!
//! A payload is wrapped for a recipient with an ephemeral X25519 exchange:
//!
//! 1. Generate an ephemeral X25519 secret.
//! 2. Compute the shared secret with the recipient's public key.
//! 3. Derive a wrapping key with HKDF-SHA256
//!    (`salt = ephemeral_pub || recipient_pub`).
//! 4. Seal the payload with XChaCha20-Poly1305, authenticating the ephemeral
//!    public key.
//!
//! Only the holder of the recipient's private key can recompute step 2.
//!
//! # Wire format
//!
//! ```text
//! [ ephemeral_pub: 32 ][ nonce: 24 ][ ciphertext + tag ]
//! ```

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::aead::{self, Sealed, NONCE_SIZE, TAG_SIZE};
use crate::keys::KEY_LENGTH;
use snapvault_common::{codec, Error, Result};

/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Bytes added to a payload by [`wrap_for`].
pub const WRAP_OVERHEAD: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE;

const KEY_TYPE: &str = "X25519";
const WRAP_INFO: &[u8] = b"snapvault-share-wrap-v1";

/// Public half of a user's key pair. Stored server-side in the clear.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(X25519Public);

/// Exportable description of a public key.
#[derive(Debug, Serialize, Deserialize)]
struct KeyDescriptor {
    kty: String,
    x: String,
}

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(X25519Public::from(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Export as a JSON key descriptor: `{"kty":"X25519","x":"<base64>"}`.
    pub fn to_descriptor(&self) -> String {
        let descriptor = KeyDescriptor {
            kty: KEY_TYPE.to_string(),
            x: codec::encode(self.as_bytes()),
        };
        // A struct of two strings always serializes.
        serde_json::to_string(&descriptor).unwrap_or_default()
    }

    /// Import from a JSON key descriptor.
    ///
    /// # Errors
    /// - Returns `InvalidInput` if the descriptor is malformed or not an X25519 key
    pub fn from_descriptor(descriptor: &str) -> Result<Self> {
        let parsed: KeyDescriptor = serde_json::from_str(descriptor)
            .map_err(|_| Error::InvalidInput("Invalid key".to_string()))?;
        if parsed.kty != KEY_TYPE {
            return Err(Error::InvalidInput(format!(
                "Unsupported key type: {}",
                parsed.kty
            )));
        }
        let bytes = codec::decode_array::<PUBLIC_KEY_SIZE>(&parsed.x)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", codec::encode(self.as_bytes()))
    }
}

/// Private half of a user's key pair.
///
/// Only ever persisted wrapped under the owner's root secret.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw bytes, for wrapping.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_LENGTH]> {
        Zeroizing::new(self.0.to_bytes())
    }

    /// Public half matching this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// A user's asymmetric key pair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let private = PrivateKey(StaticSecret::random_from_rng(OsRng));
        Self {
            public: private.public_key(),
            private,
        }
    }
}

fn derive_wrap_key(
    shared: &[u8],
    ephemeral: &[u8; PUBLIC_KEY_SIZE],
    recipient: &[u8; PUBLIC_KEY_SIZE],
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let mut salt = [0u8; 2 * PUBLIC_KEY_SIZE];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient);

    let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
    Hkdf::<Sha256>::new(Some(&salt), shared)
        .expand(WRAP_INFO, &mut okm[..])
        .map_err(|e| Error::Primitive(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Wrap `payload` so only the holder of `recipient`'s private key can open it.
///
/// # Errors
/// - Returns `Primitive` if the recipient key is a low-order point
/// - Returns `Primitive` if encryption fails
pub fn wrap_for(recipient: &PublicKey, payload: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient.0);
    if !shared.was_contributory() {
        return Err(Error::Primitive(
            "Recipient public key is not usable".to_string(),
        ));
    }

    let kek = derive_wrap_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )?;
    let sealed = aead::seal(&kek[..], payload, ephemeral_public.as_bytes())?;

    let mut wrapped = Vec::with_capacity(WRAP_OVERHEAD + payload.len());
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&sealed.nonce);
    wrapped.extend_from_slice(&sealed.ciphertext);
    Ok(wrapped)
}

/// Open a payload produced by [`wrap_for`].
///
/// # Errors
/// - Returns `Primitive` if the input is truncated
/// - Returns `Primitive` if it was wrapped for a different key or tampered with
pub fn unwrap_with(private: &PrivateKey, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() < WRAP_OVERHEAD {
        return Err(Error::Primitive("Wrapped key too short".to_string()));
    }

    let (ephemeral_bytes, rest) = wrapped.split_at(PUBLIC_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = X25519Public::from(ephemeral);

    let shared = private.0.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(Error::Primitive("Wrapped key is not usable".to_string()));
    }

    let kek = derive_wrap_key(
        shared.as_bytes(),
        &ephemeral,
        private.public_key().as_bytes(),
    )?;
    let sealed = Sealed::new(nonce.to_vec(), ciphertext.to_vec());
    aead::open(&kek[..], &sealed, &ephemeral)
}
