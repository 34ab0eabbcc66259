//! Adapter over the cryptographic primitives.
//!
//! Higher layers never call the primitive modules directly; they take an
//! `Arc<dyn PrimitiveProvider>` so the whole key hierarchy can be driven by a
//! different backend without touching protocol code.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{self, Sealed};
use crate::asymmetric::{self, KeyPair, PrivateKey, PublicKey};
use crate::kdf::{self, KdfParams};
use crate::keys::{Salt, KEY_LENGTH, SALT_LENGTH};
use snapvault_common::Result;

/// Cryptographic operations used by the key hierarchy and the pipelines.
///
/// Every rejection by an underlying primitive surfaces as `Error::Primitive`.
pub trait PrimitiveProvider: Send + Sync {
    /// Derive a 256-bit key from a secret and salt.
    fn derive_key(
        &self,
        secret: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<Zeroizing<[u8; KEY_LENGTH]>>;

    /// Authenticated encryption under a fresh nonce.
    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed>;

    /// Authenticated decryption.
    fn open(&self, key: &[u8], sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Generate an asymmetric key pair.
    fn generate_keypair(&self) -> KeyPair;

    /// Wrap a payload for the holder of `recipient`'s private key.
    fn wrap_for(&self, recipient: &PublicKey, payload: &[u8]) -> Result<Vec<u8>>;

    /// Open a payload wrapped with [`PrimitiveProvider::wrap_for`].
    fn unwrap_with(&self, private: &PrivateKey, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Fill `buf` with cryptographically secure random bytes.
    fn fill_random(&self, buf: &mut [u8]);

    /// Generate a random per-user salt.
    fn generate_salt(&self) -> Salt {
        let mut bytes = [0u8; SALT_LENGTH];
        self.fill_random(&mut bytes);
        Salt::from_bytes(bytes)
    }

    /// Generate random symmetric key material.
    fn generate_key_bytes(&self) -> Zeroizing<[u8; KEY_LENGTH]> {
        let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
        self.fill_random(&mut bytes[..]);
        bytes
    }
}

/// Default provider: PBKDF2/Argon2id, XChaCha20-Poly1305, X25519 sealed wrap,
/// OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProvider;

impl StandardProvider {
    pub fn new() -> Self {
        Self
    }
}

impl PrimitiveProvider for StandardProvider {
    fn derive_key(
        &self,
        secret: &[u8],
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        kdf::derive_key(secret, salt, params)
    }

    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
        aead::seal(key, plaintext, aad)
    }

    fn open(&self, key: &[u8], sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        aead::open(key, sealed, aad)
    }

    fn generate_keypair(&self) -> KeyPair {
        KeyPair::generate()
    }

    fn wrap_for(&self, recipient: &PublicKey, payload: &[u8]) -> Result<Vec<u8>> {
        asymmetric::wrap_for(recipient, payload)
    }

    fn unwrap_with(&self, private: &PrivateKey, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        asymmetric::unwrap_with(private, wrapped)
    }

    fn fill_random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}
