//! Identifier newtypes
//!
//! Every aggregate gets its own UUID-backed id type so a song id can never be
//! passed where an entry id is expected. Mutation ids are session-local
//! sequence numbers rather than UUIDs because their order is meaningful.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id
            pub fn new() -> Self {
                Self(generate())
            }

            /// Parse from the hyphenated string form
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                parse(s).map(Self)
            }

            /// Raw bytes of the underlying UUID
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// One scheduled event (the aggregate root)
    ServiceId
);
uuid_id!(
    /// One placement of a song in a service; temporary until the store confirms it
    EntryId
);
uuid_id!(
    /// Song in the external catalog
    SongId
);
uuid_id!(
    /// One running client (browser tab, device, simulated peer)
    ClientId
);
uuid_id!(
    /// Acting user
    UserId
);
uuid_id!(
    /// Tenant (church/organisation) the user acts within
    TenantId
);

/// Session-local mutation sequence number; defines submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse UUID from string
pub fn parse(s: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(EntryId::new(), EntryId::new());
    }

    #[test]
    fn test_parse_roundtrips_display() {
        let id = ServiceId::new();
        let parsed = ServiceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(SongId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_mutation_ids_order_by_sequence() {
        assert!(MutationId(3) < MutationId(10));
        assert_eq!(MutationId(7).to_string(), "m7");
    }
}
