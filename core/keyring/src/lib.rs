//! Key management for SnapVault.
//!
//! This module provides:
//! - Root secret derivation and password verification
//! - The wrapping hierarchy below the root secret
//! - The public-key sharing protocol
//! - A device-local encrypted key cache with a fixed freshness window
//! - Session handling with secure key management
//!
//! # Architecture
//! The keyring sits between the media pipelines and the server collaborators.
//! It is the only layer that ever holds unwrapped keys.

pub mod cache;
pub mod config;
pub mod hierarchy;
pub mod root;
pub mod session;
pub mod sharing;

pub use cache::{collection_key_id, DeviceFingerprint, KeyCache, ROOT_SECRET_ID};
pub use config::KeyringConfig;
pub use hierarchy::KeyHierarchy;
pub use root::{
    derive_root_secret, initialize_root_secret, verify_password, PasswordPolicy, RootSecretSetup,
};
pub use session::{KeyManager, KeyStores, SessionState};
pub use sharing::{Recipient, SharingService};
