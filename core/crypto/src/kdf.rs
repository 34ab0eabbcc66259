//! Password-based key derivation.
//!
//! PBKDF2-HMAC-SHA256 is the default; Argon2id is available for deployments
//! that prefer a memory-hard function. Both produce a 256-bit key that is
//! deterministic given the same secret, salt and parameters.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::keys::KEY_LENGTH;
use snapvault_common::{Error, Result, UserId};

/// Lowest PBKDF2 iteration count accepted by configuration validation.
pub const MIN_PBKDF2_ITERATIONS: u32 = 200_000;

/// Parameters for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KdfParams {
    /// PBKDF2 with HMAC-SHA256.
    Pbkdf2Sha256 {
        /// Number of iterations.
        iterations: u32,
    },
    /// Argon2id.
    Argon2id {
        /// Memory cost in KiB (e.g., 65536 = 64 MiB).
        memory_cost: u32,
        /// Number of iterations.
        time_cost: u32,
        /// Degree of parallelism.
        parallelism: u32,
    },
}

impl KdfParams {
    /// Parameters for deriving a user's root secret from their password.
    pub fn root_secret() -> Self {
        Self::Pbkdf2Sha256 {
            iterations: 210_000,
        }
    }

    /// Parameters for deriving the device key of the local cache.
    pub fn device() -> Self {
        Self::Pbkdf2Sha256 {
            iterations: 600_000,
        }
    }

    /// PBKDF2 with an explicit iteration count.
    pub fn pbkdf2(iterations: u32) -> Self {
        Self::Pbkdf2Sha256 { iterations }
    }

    /// Argon2id parameters suitable for interactive use.
    pub fn argon2_interactive() -> Self {
        Self::Argon2id {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Argon2id parameters for mobile devices.
    pub fn argon2_moderate() -> Self {
        Self::Argon2id {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Whether these parameters meet the password-hardening floor.
    pub fn meets_policy(&self) -> bool {
        match self {
            Self::Pbkdf2Sha256 { iterations } => *iterations >= MIN_PBKDF2_ITERATIONS,
            Self::Argon2id {
                memory_cost,
                time_cost,
                ..
            } => *memory_cost >= 19 * 1024 && *time_cost >= 2,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::root_secret()
    }
}

/// Normalize a password before derivation.
///
/// Surrounding whitespace is dropped and the result is NFC-normalized so the
/// same password typed on different platforms derives the same key.
pub fn normalize_password(password: &str) -> Zeroizing<String> {
    Zeroizing::new(password.trim().nfc().collect())
}

/// Build the secret input for root secret derivation: `nfc(password) || user_id`.
///
/// Binding the user id means two users with the same password and salt still
/// derive different keys.
///
/// # Errors
/// - Returns error if the normalized password is empty
pub fn password_material(password: &str, user_id: &UserId) -> Result<Zeroizing<Vec<u8>>> {
    let normalized = normalize_password(password);
    if normalized.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    let mut material = Zeroizing::new(Vec::with_capacity(
        normalized.len() + user_id.as_str().len(),
    ));
    material.extend_from_slice(normalized.as_bytes());
    material.extend_from_slice(user_id.as_str().as_bytes());
    Ok(material)
}

/// Derive a 256-bit key from a secret and salt.
///
/// # Preconditions
/// - `secret` must not be empty
/// - `params` must have a nonzero work factor
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns `InvalidInput` if secret is empty
/// - Returns `Primitive` if the parameters are rejected
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    if secret.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut key_bytes = Zeroizing::new([0u8; KEY_LENGTH]);

    match *params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            if iterations == 0 {
                return Err(Error::Primitive(
                    "PBKDF2 iteration count must be nonzero".to_string(),
                ));
            }
            pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key_bytes[..]);
        }
        KdfParams::Argon2id {
            memory_cost,
            time_cost,
            parallelism,
        } => {
            let argon2_params = Params::new(memory_cost, time_cost, parallelism, Some(KEY_LENGTH))
                .map_err(|e| Error::Primitive(format!("Invalid KDF parameters: {}", e)))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(secret, salt, &mut key_bytes[..])
                .map_err(|e| Error::Primitive(format!("Key derivation failed: {}", e)))?;
        }
    }

    Ok(key_bytes)
}
