//! Common utilities and types shared across SnapVault modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod clock;
pub mod codec;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{
    CollectionId, GrantId, ItemId, KeyUsage, KeyUsages, Permission, SensitiveBytes, UserId,
};
