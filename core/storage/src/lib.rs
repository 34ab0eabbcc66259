//! Collaborator interfaces for SnapVault.
//!
//! This module defines the traits through which the key hierarchy and the
//! media pipelines reach the server (identity directory, account keys,
//! wrapped collection keys, share grants, transfers) and device-local storage,
//! together with in-memory and filesystem implementations.
//!
//! # Design Principles
//! - The server only ever sees public keys and wrapped key material
//! - Async operations: All I/O operations are async
//! - Multi-record updates (grant acceptance) are atomic
//! - Unified error semantics: Consistent error types across implementations

pub mod kv;
pub mod local;
pub mod memory;
pub mod provider;
pub mod records;

pub use kv::MemoryStore;
pub use local::FileStore;
pub use memory::MemoryBackend;
pub use provider::{
    AccountStore, GrantStore, IdentityDirectory, LocalStore, ObjectTransport, TransferService,
    WrappedKeyStore,
};
pub use records::{
    AccountKeys, GrantAcceptance, GrantRequest, ItemRecord, PublicIdentity, ShareGrant,
    TransferTarget,
};
