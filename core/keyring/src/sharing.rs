//! Sharing protocol.
//!
//! 1. The granter resolves the grantee's public key.
//! 2. The granter seals its collection key to that public key and submits a
//!    pending grant. The server never sees the key.
//! 3. The grantee opens the sealed key with its private key, narrows it to the
//!    granted permission, re-wraps it under its own root secret and submits
//!    the acceptance, which the server applies atomically.

use std::sync::Arc;
use tracing::{debug, info};

use crate::session::KeyManager;
use snapvault_common::{CollectionId, Error, GrantId, Permission, Result, UserId};
use snapvault_crypto::{CollectionKey, PublicKey};
use snapvault_storage::{GrantAcceptance, GrantRequest, GrantStore, IdentityDirectory, ShareGrant};

/// A resolved share recipient.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: UserId,
    pub public_key: PublicKey,
}

/// Grants and accepts access to collections on behalf of one user.
pub struct SharingService {
    manager: Arc<KeyManager>,
    directory: Arc<dyn IdentityDirectory>,
    grants: Arc<dyn GrantStore>,
}

impl SharingService {
    pub fn new(
        manager: Arc<KeyManager>,
        directory: Arc<dyn IdentityDirectory>,
        grants: Arc<dyn GrantStore>,
    ) -> Self {
        Self {
            manager,
            directory,
            grants,
        }
    }

    /// Look up the user behind `identity`.
    ///
    /// # Errors
    /// - `NotFound` if the identity is unknown or is the current user
    /// - `InvalidInput` if the published key cannot be parsed
    pub async fn resolve_recipient(&self, identity: &str) -> Result<Recipient> {
        let found = self
            .directory
            .find_public_key(identity)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User not found: {}", identity)))?;

        if &found.user_id == self.manager.user_id() {
            return Err(Error::NotFound(
                "Cannot share an album with yourself".to_string(),
            ));
        }

        Ok(Recipient {
            user_id: found.user_id,
            public_key: PublicKey::from_descriptor(&found.public_key)?,
        })
    }

    /// Offer `identity` access to a collection.
    ///
    /// # Preconditions
    /// - The current user holds the collection key
    ///
    /// # Postconditions
    /// - A pending grant carrying the sealed key is stored
    ///
    /// # Errors
    /// - `NotFound` if the recipient cannot be resolved
    /// - `KeyNotFound` if the current user holds no key for the collection
    /// - `NotPermitted` if the server refuses the grant
    pub async fn grant_access(
        &self,
        collection_id: &CollectionId,
        identity: &str,
        permission: Permission,
    ) -> Result<GrantId> {
        let recipient = self.resolve_recipient(identity).await?;
        let key = self.manager.collection_key(collection_id).await?;
        let sealed_key = self
            .manager
            .hierarchy()
            .seal_for_recipient(&key, &recipient.public_key)?;

        let grant = self
            .grants
            .create_grant(GrantRequest {
                collection_id: collection_id.clone(),
                granter: self.manager.user_id().clone(),
                grantee: recipient.user_id.clone(),
                sealed_key,
                permission,
            })
            .await?;

        info!(
            grant = %grant.id,
            collection = %collection_id,
            grantee = %recipient.user_id,
            %permission,
            "Access granted"
        );
        Ok(grant.id)
    }

    /// Grants addressed to the current user.
    pub async fn pending_grants(&self) -> Result<Vec<ShareGrant>> {
        self.grants.list_grants_for(self.manager.user_id()).await
    }

    /// Accept a grant addressed to the current user.
    ///
    /// The password unlocks the session if it is locked. If the user already
    /// holds the collection key, its material is reused instead of opening the
    /// sealed copy, with usages taken from the grant alone. The local cache is only written once the server has
    /// applied the acceptance, so an interrupted acceptance can be retried.
    ///
    /// # Errors
    /// - `NotFound` if the grant does not exist
    /// - `NotPermitted` if the grant is addressed to someone else
    /// - `WrongPassword` if unlocking fails
    /// - `Primitive` if the sealed key cannot be opened
    pub async fn accept_grant(&self, grant_id: &GrantId, password: &str) -> Result<CollectionKey> {
        let grant = self
            .grants
            .get_grant(grant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Invite not found: {}", grant_id)))?;
        if &grant.grantee != self.manager.user_id() {
            return Err(Error::NotPermitted(
                "Invite is addressed to another user".to_string(),
            ));
        }

        if !self.manager.is_unlocked() {
            self.manager.unlock(password).await?;
        }

        let usages = grant.permission.usages();
        let key = match self.manager.held_collection_key(&grant.collection_id).await? {
            Some(held) => {
                debug!(collection = %grant.collection_id, "Reusing held collection key");
                CollectionKey::from_bytes(*held.as_bytes(), usages)
            }
            None => {
                let private_key = self.manager.private_key()?;
                self.manager
                    .hierarchy()
                    .open_from_granter(&grant.sealed_key, &private_key)?
                    .restrict(usages)
            }
        };

        let root_secret = self.manager.root_secret()?;
        let wrapped_key = self.manager.hierarchy().wrap_collection_key(
            &key,
            &grant.collection_id,
            &root_secret,
        )?;

        self.grants
            .accept_grant(GrantAcceptance {
                grant_id: grant.id.clone(),
                grantee: grant.grantee.clone(),
                collection_id: grant.collection_id.clone(),
                permission: grant.permission,
                wrapped_key,
            })
            .await?;

        self.manager
            .cache_collection_key(&grant.collection_id, &key)
            .await?;
        info!(
            grant = %grant.id,
            collection = %grant.collection_id,
            permission = %grant.permission,
            "Grant accepted"
        );
        Ok(key)
    }
}
