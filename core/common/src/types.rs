//! Common types used throughout SnapVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if `id` is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot be empty",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a user account.
    UserId,
    "UserId"
);

string_id!(
    /// Identifier of a protected collection (an album).
    CollectionId,
    "CollectionId"
);

string_id!(
    /// Identifier of a single media item inside a collection.
    ItemId,
    "ItemId"
);

string_id!(
    /// Identifier of a pending share grant.
    GrantId,
    "GrantId"
);

/// A single cryptographic operation a key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    WrapKey,
    UnwrapKey,
}

impl KeyUsage {
    const ALL: [KeyUsage; 4] = [
        KeyUsage::Encrypt,
        KeyUsage::Decrypt,
        KeyUsage::WrapKey,
        KeyUsage::UnwrapKey,
    ];

    fn bit(self) -> u8 {
        match self {
            KeyUsage::Encrypt => 0b0001,
            KeyUsage::Decrypt => 0b0010,
            KeyUsage::WrapKey => 0b0100,
            KeyUsage::UnwrapKey => 0b1000,
        }
    }
}

/// Set of usages attached to a key.
///
/// Serialized as a list (`["encrypt","decrypt"]`) and packed into a single
/// byte when it travels inside a wrapped key payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<KeyUsage>", into = "Vec<KeyUsage>")]
pub struct KeyUsages(u8);

impl KeyUsages {
    /// Usage set of a freshly generated content key.
    pub const CONTENT: Self = Self(0b0011);

    /// Usage set of a key that only wraps other keys.
    pub const WRAPPING: Self = Self(0b1100);

    /// Empty usage set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a set from individual usages.
    pub fn from_usages(usages: &[KeyUsage]) -> Self {
        Self(usages.iter().fold(0, |acc, usage| acc | usage.bit()))
    }

    /// Whether the set contains `usage`.
    pub fn allows(&self, usage: KeyUsage) -> bool {
        self.0 & usage.bit() != 0
    }

    /// Intersection of two sets.
    pub fn intersect(&self, other: KeyUsages) -> Self {
        Self(self.0 & other.0)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Packed single-byte form.
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Parse the packed form.
    ///
    /// # Errors
    /// - Returns error if unknown bits are set
    pub fn from_byte(byte: u8) -> crate::Result<Self> {
        if byte & !0b1111 != 0 {
            return Err(crate::Error::InvalidInput(format!(
                "Unknown key usage bits: {:#010b}",
                byte
            )));
        }
        Ok(Self(byte))
    }

    /// Iterate the contained usages.
    pub fn iter(&self) -> impl Iterator<Item = KeyUsage> + '_ {
        KeyUsage::ALL.into_iter().filter(|u| self.allows(*u))
    }
}

impl From<Vec<KeyUsage>> for KeyUsages {
    fn from(usages: Vec<KeyUsage>) -> Self {
        Self::from_usages(&usages)
    }
}

impl From<KeyUsages> for Vec<KeyUsage> {
    fn from(usages: KeyUsages) -> Self {
        usages.iter().collect()
    }
}

impl fmt::Debug for KeyUsages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Access level granted on a collection.
///
/// Resolved once at grant acceptance into the concrete usage set the
/// grantee's copy of the collection key carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "read")]
    ReadOnly,
    #[serde(rename = "write")]
    ReadWrite,
}

impl Permission {
    /// Usage set a collection key carries under this permission.
    pub fn usages(&self) -> KeyUsages {
        match self {
            Permission::ReadOnly => KeyUsages::from_usages(&[KeyUsage::Decrypt]),
            Permission::ReadWrite => KeyUsages::CONTENT,
        }
    }

    /// Whether items may be added under this permission.
    pub fn can_write(&self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

impl std::str::FromStr for Permission {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "read" | "read-only" => Ok(Permission::ReadOnly),
            "write" | "read-write" => Ok(Permission::ReadWrite),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown permission: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ReadOnly => write!(f, "read"),
            Permission::ReadWrite => write!(f, "write"),
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_id_creation() {
        let id = UserId::new("alice").unwrap();
        assert_eq!(id.as_str(), "alice");
        assert_eq!(id.to_string(), "alice");
    }

    #[test]
    fn test_id_empty_fails() {
        assert!(UserId::new("").is_err());
        assert!(CollectionId::new("   ").is_err());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = ItemId::new("p1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""p1""#);
    }

    #[test]
    fn test_permission_usages() {
        let read = Permission::ReadOnly.usages();
        assert!(read.allows(KeyUsage::Decrypt));
        assert!(!read.allows(KeyUsage::Encrypt));

        let write = Permission::ReadWrite.usages();
        assert!(write.allows(KeyUsage::Decrypt));
        assert!(write.allows(KeyUsage::Encrypt));
    }

    #[test]
    fn test_permission_parse_and_display() {
        assert_eq!("read".parse::<Permission>().unwrap(), Permission::ReadOnly);
        assert_eq!("write".parse::<Permission>().unwrap(), Permission::ReadWrite);
        assert!("owner".parse::<Permission>().is_err());
        assert_eq!(Permission::ReadOnly.to_string(), "read");
    }

    #[test]
    fn test_usages_serialize_as_list() {
        let json = serde_json::to_string(&KeyUsages::CONTENT).unwrap();
        assert_eq!(json, r#"["encrypt","decrypt"]"#);
        let parsed: KeyUsages = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, KeyUsages::CONTENT);
    }

    #[test]
    fn test_usages_unknown_bits_rejected() {
        assert!(KeyUsages::from_byte(0b1_0000).is_err());
    }

    #[test]
    fn test_sensitive_bytes_debug_redacted() {
        let bytes = SensitiveBytes::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", bytes), "SensitiveBytes([REDACTED; 3 bytes])");
    }

    proptest! {
        #[test]
        fn prop_usage_byte_roundtrip(bits in 0u8..16) {
            let usages = KeyUsages::from_byte(bits).unwrap();
            prop_assert_eq!(KeyUsages::from_byte(usages.to_byte()).unwrap(), usages);
        }

        #[test]
        fn prop_intersect_never_widens(a in 0u8..16, b in 0u8..16) {
            let left = KeyUsages::from_byte(a).unwrap();
            let right = KeyUsages::from_byte(b).unwrap();
            let both = left.intersect(right);
            for usage in both.iter() {
                prop_assert!(left.allows(usage) && right.allows(usage));
            }
        }
    }
}
