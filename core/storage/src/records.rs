//! Records exchanged with the server-side collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snapvault_common::{codec, CollectionId, GrantId, ItemId, Permission, UserId};
use snapvault_crypto::{KdfParams, Salt, Sealed};

/// A user's public key as published in the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub user_id: UserId,
    /// JSON key descriptor of the user's public key.
    pub public_key: String,
}

/// Per-user key material held by the server.
///
/// Everything here is either public or wrapped under the user's root secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKeys {
    pub salt: Salt,
    /// The salt sealed under the root secret; proves knowledge of the password.
    pub verifier: Sealed,
    /// JSON key descriptor of the public key.
    pub public_key: String,
    pub wrapped_private_key: Sealed,
    /// Parameters the root secret was derived with.
    pub kdf: KdfParams,
}

/// A share grant as submitted by the granter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub collection_id: CollectionId,
    pub granter: UserId,
    pub grantee: UserId,
    /// Collection key payload wrapped for the grantee's public key.
    #[serde(with = "codec::base64_bytes")]
    pub sealed_key: Vec<u8>,
    pub permission: Permission,
}

/// A pending share grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub id: GrantId,
    pub collection_id: CollectionId,
    pub granter: UserId,
    pub grantee: UserId,
    #[serde(with = "codec::base64_bytes")]
    pub sealed_key: Vec<u8>,
    pub permission: Permission,
    pub created_at: DateTime<Utc>,
}

/// Everything the server applies in one step when a grantee accepts a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantAcceptance {
    pub grant_id: GrantId,
    pub grantee: UserId,
    pub collection_id: CollectionId,
    pub permission: Permission,
    /// Collection key re-wrapped under the grantee's root secret.
    pub wrapped_key: Sealed,
}

/// Metadata stored alongside an uploaded item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: ItemId,
    pub collection_id: CollectionId,
    pub owner: UserId,
    #[serde(with = "codec::base64_bytes")]
    pub nonce: Vec<u8>,
    pub ciphertext_len: u64,
    pub plaintext_len: u64,
    pub created_at: DateTime<Utc>,
}

/// A short-lived location an object may be written to or read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTarget {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_crypto::keys::SALT_LENGTH;

    #[test]
    fn test_account_keys_serialization() {
        let keys = AccountKeys {
            salt: Salt::from_bytes([3u8; SALT_LENGTH]),
            verifier: Sealed::new(vec![1; 24], vec![2; 48]),
            public_key: r#"{"kty":"X25519","x":"AAAA"}"#.to_string(),
            wrapped_private_key: Sealed::new(vec![4; 24], vec![5; 48]),
            kdf: KdfParams::root_secret(),
        };

        let json = serde_json::to_string(&keys).unwrap();
        let restored: AccountKeys = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, keys);
    }

    #[test]
    fn test_grant_sealed_key_is_base64() {
        let grant = ShareGrant {
            id: GrantId::new("g1").unwrap(),
            collection_id: CollectionId::new("vacation").unwrap(),
            granter: UserId::new("alice").unwrap(),
            grantee: UserId::new("bob").unwrap(),
            sealed_key: vec![0, 0, 0],
            permission: Permission::ReadOnly,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["sealed_key"], "AAAA");
        assert_eq!(json["permission"], "read");
    }
}
