//! Root secret derivation and password verification.

use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use snapvault_common::{Error, Result, UserId};
use snapvault_crypto::{password_material, KdfParams, PrimitiveProvider, RootSecret, Salt, Sealed};

const VERIFIER_AAD: &[u8] = b"snapvault-root-verifier";

/// Symbols accepted by the password policy.
pub const POLICY_SYMBOLS: &str = "!@#$%^&*(),.?\":{}|<>";

/// Outcome of setting up a new root secret.
pub struct RootSecretSetup {
    pub salt: Salt,
    pub root_secret: RootSecret,
    /// The salt sealed under the root secret.
    pub verifier: Sealed,
}

/// Derive a user's root secret from their password.
///
/// The password is trimmed and NFC-normalized, then concatenated with the
/// user id. Derivation runs on the blocking thread pool.
///
/// # Errors
/// - Returns `InvalidInput` if the password is empty
/// - Returns `Primitive` if derivation fails
pub async fn derive_root_secret(
    provider: Arc<dyn PrimitiveProvider>,
    user_id: &UserId,
    password: &str,
    salt: &Salt,
    params: KdfParams,
) -> Result<RootSecret> {
    let material = password_material(password, user_id)?;
    let salt = salt.clone();

    let key = tokio::task::spawn_blocking(move || {
        provider.derive_key(&material, salt.as_bytes(), &params)
    })
    .await
    .map_err(|e| Error::Primitive(format!("Key derivation task failed: {}", e)))??;

    Ok(RootSecret::from_bytes(*key))
}

/// Seal the salt under the root secret, producing the password verifier.
pub fn create_verifier(
    provider: &dyn PrimitiveProvider,
    root_secret: &RootSecret,
    salt: &Salt,
) -> Result<Sealed> {
    provider.seal(root_secret.as_bytes(), salt.as_bytes(), VERIFIER_AAD)
}

/// Whether `root_secret` opens the verifier to exactly the salt.
pub fn matches_verifier(
    provider: &dyn PrimitiveProvider,
    root_secret: &RootSecret,
    salt: &Salt,
    verifier: &Sealed,
) -> bool {
    match provider.open(root_secret.as_bytes(), verifier, VERIFIER_AAD) {
        Ok(plaintext) => bool::from(plaintext.as_slice().ct_eq(salt.as_bytes())),
        Err(_) => false,
    }
}

/// Create a root secret for a new account.
///
/// # Postconditions
/// - The salt is freshly generated
/// - The verifier opens to the salt under the returned root secret
pub async fn initialize_root_secret(
    provider: Arc<dyn PrimitiveProvider>,
    user_id: &UserId,
    password: &str,
    params: KdfParams,
) -> Result<RootSecretSetup> {
    let salt = provider.generate_salt();
    let root_secret =
        derive_root_secret(provider.clone(), user_id, password, &salt, params).await?;
    let verifier = create_verifier(provider.as_ref(), &root_secret, &salt)?;
    debug!(user = %user_id, "Root secret initialized");

    Ok(RootSecretSetup {
        salt,
        root_secret,
        verifier,
    })
}

/// Check a password against the stored verifier.
///
/// # Errors
/// - Returns `WrongPassword` on any failure; callers cannot tell a wrong
///   password from a damaged verifier
pub async fn verify_password(
    provider: Arc<dyn PrimitiveProvider>,
    user_id: &UserId,
    password: &str,
    salt: &Salt,
    verifier: &Sealed,
    params: KdfParams,
) -> Result<RootSecret> {
    let root_secret = derive_root_secret(provider.clone(), user_id, password, salt, params)
        .await
        .map_err(|_| Error::WrongPassword)?;

    if matches_verifier(provider.as_ref(), &root_secret, salt, verifier) {
        Ok(root_secret)
    } else {
        Err(Error::WrongPassword)
    }
}

/// Minimal password rules applied when a password is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    /// Passwords must be strictly longer than this.
    pub min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self { min_length: 7 }
    }
}

impl PasswordPolicy {
    /// Check a candidate password.
    ///
    /// # Errors
    /// - Returns `InvalidInput` naming the first rule that is not met
    pub fn check(&self, password: &str) -> Result<()> {
        if password.chars().count() <= self.min_length {
            return Err(Error::InvalidInput(format!(
                "Password must be longer than {} characters",
                self.min_length
            )));
        }
        if !password.chars().any(|c| c.is_uppercase()) {
            return Err(Error::InvalidInput(
                "Password must contain an uppercase letter".to_string(),
            ));
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(
                "Password must contain a number".to_string(),
            ));
        }
        if !password.chars().any(|c| POLICY_SYMBOLS.contains(c)) {
            return Err(Error::InvalidInput(format!(
                "Password must contain one of {}",
                POLICY_SYMBOLS
            )));
        }
        Ok(())
    }
}
