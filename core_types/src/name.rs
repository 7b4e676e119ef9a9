//! Node names

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique name of a node.
///
/// Names are 128 bits and randomly generated once at the start of a node's
/// lifetime. They are large and random for global uniqueness, not secrecy.
/// A default-constructed name is invalid and names no node; brokers assign
/// valid names to the nodes they connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeName(Uuid);

impl NodeName {
    /// Generates a fresh random name.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a name from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Reconstructs a name from its wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the wire representation of this name.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Whether this name actually names a node.
    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }
}

impl Default for NodeName {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.as_bytes();
        write!(f, "node:{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique() {
        let a = NodeName::generate();
        let b = NodeName::generate();
        assert_ne!(a, b);
        assert!(a.is_valid());
        assert!(b.is_valid());
    }

    #[test]
    fn test_default_name_is_invalid() {
        assert!(!NodeName::default().is_valid());
    }

    #[test]
    fn test_byte_round_trip() {
        let name = NodeName::generate();
        assert_eq!(NodeName::from_bytes(name.to_bytes()), name);
    }
}
