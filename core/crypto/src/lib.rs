//! Cryptographic primitives for SnapVault.
//!
//! This module provides:
//! - Password-based key derivation (PBKDF2-HMAC-SHA256, or Argon2id)
//! - Authenticated encryption using XChaCha20-Poly1305
//! - X25519 key pairs and sealed key wrapping for sharing
//! - Secure key types with automatic zeroization
//! - A [`PrimitiveProvider`] adapter the higher layers depend on
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod asymmetric;
pub mod kdf;
pub mod keys;
pub mod provider;

pub use aead::{open, seal, Sealed};
pub use asymmetric::{KeyPair, PrivateKey, PublicKey};
pub use kdf::{derive_key, normalize_password, password_material, KdfParams};
pub use keys::{CacheableKey, CollectionKey, DeviceKey, RootSecret, Salt, KEY_LENGTH};
pub use provider::{PrimitiveProvider, StandardProvider};
